use std::sync::Arc;

use tracing::{trace, warn};
use unitwork_core::{FieldMap, Identity, SessionId, Version};
use unitwork_storage::{StorageBackend, StorageError};

use crate::error::{Conflict, SessionError};

/// Version-checked writes. Each call is a single attempt: a mismatch is
/// reported as [`SessionError::StaleState`] and never retried here.
pub struct OptimisticLockCoordinator {
    session_id: SessionId,
    backend: Arc<dyn StorageBackend>,
}

impl OptimisticLockCoordinator {
    pub(crate) fn new(session_id: SessionId, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            session_id,
            backend,
        }
    }

    /// Write `fields` if the row is still at `expected`; returns the new
    /// version, always `expected + 1`.
    pub fn conditional_write(
        &self,
        identity: &Identity,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<Version, SessionError> {
        match self.backend.conditional_update(identity, expected, fields) {
            Ok(version) => {
                trace!(session = %self.session_id, %identity, %expected, %version, "conditional write");
                Ok(version)
            }
            Err(err) => Err(self.reject(err)),
        }
    }

    pub fn conditional_delete(&self, identity: &Identity, expected: Version) -> Result<(), SessionError> {
        match self.backend.delete(identity, expected) {
            Ok(()) => {
                trace!(session = %self.session_id, %identity, %expected, "conditional delete");
                Ok(())
            }
            Err(err) => Err(self.reject(err)),
        }
    }

    fn reject(&self, err: StorageError) -> SessionError {
        match err {
            StorageError::VersionMismatch {
                identity,
                expected,
                actual,
            } => {
                let conflict = Conflict {
                    identity,
                    expected,
                    actual,
                };
                warn!(session = %self.session_id, %conflict, "optimistic lock conflict");
                SessionError::StaleState(conflict)
            }
            other => other.into(),
        }
    }
}
