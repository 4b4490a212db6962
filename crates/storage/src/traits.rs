use unitwork_core::{EntityType, FieldMap, Identity, Key, Version};

use crate::error::StorageError;

/// Persisted state of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub fields: FieldMap,
    pub version: Version,
}

/// Point reads and writes by identity, shared by every session.
///
/// Implementations must make each call atomic on its own: a conditional
/// update or delete checks the stored version and applies the change as one
/// step. Nothing is assumed about atomicity across calls.
pub trait StorageBackend: Send + Sync {
    fn read(&self, identity: &Identity) -> Result<Option<StoredRow>, StorageError>;

    /// Insert a new row at version 0. When `key` is `None` the backend
    /// generates one. Inserting an existing key fails with `AlreadyExists`.
    fn insert(
        &self,
        entity_type: &EntityType,
        key: Option<Key>,
        fields: &FieldMap,
    ) -> Result<(Identity, Version), StorageError>;

    /// Replace the row's fields if its stored version equals `expected`,
    /// returning the new version (`expected + 1`). Otherwise fails with
    /// `VersionMismatch`.
    fn conditional_update(
        &self,
        identity: &Identity,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<Version, StorageError>;

    /// Remove the row if its stored version equals `expected`.
    fn delete(&self, identity: &Identity, expected: Version) -> Result<(), StorageError>;

    fn row_count(&self) -> Result<u64, StorageError>;
}
