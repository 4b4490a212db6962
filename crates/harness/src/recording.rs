use std::sync::Arc;

use parking_lot::Mutex;
use unitwork_core::{EntityType, FieldMap, Identity, Key, Version};
use unitwork_storage::{StorageBackend, StorageError, StoredRow};

/// One call that reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Read(Identity),
    Insert {
        entity_type: EntityType,
        key: Option<Key>,
    },
    ConditionalUpdate {
        identity: Identity,
        expected: Version,
    },
    Delete {
        identity: Identity,
        expected: Version,
    },
}

impl BackendCall {
    pub fn is_write(&self) -> bool {
        !matches!(self, BackendCall::Read(_))
    }
}

/// Forwards to another backend and logs every call, including rejected ones.
pub struct RecordingStorage {
    inner: Arc<dyn StorageBackend>,
    calls: Mutex<Vec<BackendCall>>,
}

impl RecordingStorage {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped backend. Calls made through it are not recorded.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn reads(&self) -> usize {
        self.calls.lock().iter().filter(|c| !c.is_write()).count()
    }

    pub fn writes(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

impl StorageBackend for RecordingStorage {
    fn read(&self, identity: &Identity) -> Result<Option<StoredRow>, StorageError> {
        self.record(BackendCall::Read(identity.clone()));
        self.inner.read(identity)
    }

    fn insert(
        &self,
        entity_type: &EntityType,
        key: Option<Key>,
        fields: &FieldMap,
    ) -> Result<(Identity, Version), StorageError> {
        self.record(BackendCall::Insert {
            entity_type: entity_type.clone(),
            key: key.clone(),
        });
        self.inner.insert(entity_type, key, fields)
    }

    fn conditional_update(
        &self,
        identity: &Identity,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<Version, StorageError> {
        self.record(BackendCall::ConditionalUpdate {
            identity: identity.clone(),
            expected,
        });
        self.inner.conditional_update(identity, expected, fields)
    }

    fn delete(&self, identity: &Identity, expected: Version) -> Result<(), StorageError> {
        self.record(BackendCall::Delete {
            identity: identity.clone(),
            expected,
        });
        self.inner.delete(identity, expected)
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        self.inner.row_count()
    }
}
