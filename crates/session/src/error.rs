use std::fmt;

use thiserror::Error;
use unitwork_core::{CoreError, Identity, Version};
use unitwork_storage::StorageError;

/// An optimistic lock check that failed: the row was not at the version the
/// session loaded it at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub identity: Identity,
    pub expected: Version,
    /// `None` when the row was deleted by someone else.
    pub actual: Option<Version>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "{} was updated concurrently (expected version {}, found {})",
                self.identity, self.expected, actual
            ),
            None => write!(
                f,
                "{} was deleted concurrently (expected version {})",
                self.identity, self.expected
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("entity not found: {0}")]
    NotFound(Identity),

    #[error("identity already present in session: {0}")]
    DuplicateIdentity(Identity),

    #[error("stale state: {0}")]
    StaleState(Conflict),

    #[error("partial commit: {} write(s) applied before failure: {source}", .applied.len())]
    PartialCommit {
        applied: Vec<Identity>,
        source: Box<SessionError>,
    },

    #[error("commit aborted after {} write(s)", .applied.len())]
    Aborted { applied: Vec<Identity> },

    #[error("could not initialize proxy for {0}: no open session")]
    LazyInitialization(Identity),

    #[error("session is closed")]
    SessionClosed,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("entity is not managed by this session: {0}")]
    NotManaged(Identity),
}

impl SessionError {
    /// The optimistic lock conflict behind this error, if any, including one
    /// wrapped in a partial commit.
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            SessionError::StaleState(conflict) => Some(conflict),
            SessionError::PartialCommit { source, .. } => source.conflict(),
            _ => None,
        }
    }

    /// Identities written to storage before the failing write.
    pub fn applied(&self) -> &[Identity] {
        match self {
            SessionError::PartialCommit { applied, .. } | SessionError::Aborted { applied } => {
                applied
            }
            _ => &[],
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionMismatch {
                identity,
                expected,
                actual,
            } => SessionError::StaleState(Conflict {
                identity,
                expected,
                actual,
            }),
            StorageError::NotFound(identity) => SessionError::NotFound(identity),
            other => SessionError::Storage(other),
        }
    }
}
