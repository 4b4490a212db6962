use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use unitwork_core::SessionId;
use unitwork_storage::StorageBackend;

use crate::config::SessionConfig;

/// Lifecycle of a session.
///
/// ```text
/// Open -> Committing -> Closed
/// Open -> RolledBack -> Closed
/// Committing -> Failed -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Committing,
    RolledBack,
    Failed,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

/// State shared between a session and the entity references it hands out.
pub(crate) struct ContextShared {
    pub(crate) session_id: SessionId,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) lazy_load_no_trans: bool,
    status: RwLock<SessionStatus>,
    abort_requested: AtomicBool,
}

impl ContextShared {
    pub(crate) fn new(backend: Arc<dyn StorageBackend>, config: &SessionConfig) -> Self {
        Self {
            session_id: SessionId::new(),
            backend,
            lazy_load_no_trans: config.lazy_load_no_trans,
            status: RwLock::new(SessionStatus::Open),
            abort_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    /// Whether proxies may still fetch through this session.
    pub(crate) fn is_open(&self) -> bool {
        matches!(self.status(), SessionStatus::Open | SessionStatus::Committing)
            && !self.abort_requested()
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }
}

/// Closes a session from outside its owning task.
///
/// The session notices the request at its next operation, or before the
/// next write of a commit in progress. Writes already applied stay applied.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<ContextShared>,
}

impl AbortHandle {
    pub(crate) fn new(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    pub fn abort(&self) {
        tracing::debug!(session = %self.shared.session_id, "abort requested");
        self.shared.request_abort();
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }
}
