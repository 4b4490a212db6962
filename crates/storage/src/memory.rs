use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;
use unitwork_core::{EntityType, FieldMap, Identity, Key, Version};

use crate::error::StorageError;
use crate::traits::{StorageBackend, StoredRow};

/// Per-call counters, used by tests to assert how much I/O a session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub reads: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl StorageStats {
    /// Inserts, updates and deletes that reached the store (including rejected ones).
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<Identity, StoredRow>,
    sequences: BTreeMap<EntityType, i64>,
    stats: StorageStats,
}

impl MemoryState {
    fn next_key(&mut self, entity_type: &EntityType) -> Key {
        let seq = self.sequences.entry(entity_type.clone()).or_insert(0);
        loop {
            *seq += 1;
            let candidate = Identity::new(entity_type.clone(), *seq);
            if !self.rows.contains_key(&candidate) {
                return Key::Int(*seq);
            }
        }
    }

    fn check_version(&self, identity: &Identity, expected: Version) -> Result<(), StorageError> {
        match self.rows.get(identity) {
            Some(row) if row.version == expected => Ok(()),
            other => Err(StorageError::VersionMismatch {
                identity: identity.clone(),
                expected,
                actual: other.map(|row| row.version),
            }),
        }
    }
}

/// In-process backend. Every call holds one lock for its whole duration,
/// which makes each conditional write atomic.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StorageStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = StorageStats::default();
    }

    /// Current stored version, without counting as a read.
    pub fn version_of(&self, identity: &Identity) -> Option<Version> {
        self.state.lock().rows.get(identity).map(|row| row.version)
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, identity: &Identity) -> Result<Option<StoredRow>, StorageError> {
        let mut state = self.state.lock();
        state.stats.reads += 1;
        trace!(%identity, "memory read");
        Ok(state.rows.get(identity).cloned())
    }

    fn insert(
        &self,
        entity_type: &EntityType,
        key: Option<Key>,
        fields: &FieldMap,
    ) -> Result<(Identity, Version), StorageError> {
        let mut state = self.state.lock();
        state.stats.inserts += 1;
        let key = match key {
            Some(key) => key,
            None => state.next_key(entity_type),
        };
        let identity = Identity::new(entity_type.clone(), key);
        if state.rows.contains_key(&identity) {
            return Err(StorageError::AlreadyExists(identity));
        }
        state.rows.insert(
            identity.clone(),
            StoredRow {
                fields: fields.clone(),
                version: Version::INITIAL,
            },
        );
        trace!(%identity, "memory insert");
        Ok((identity, Version::INITIAL))
    }

    fn conditional_update(
        &self,
        identity: &Identity,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<Version, StorageError> {
        let mut state = self.state.lock();
        state.stats.updates += 1;
        state.check_version(identity, expected)?;
        let new_version = expected
            .next()
            .ok_or_else(|| StorageError::VersionOverflow(identity.clone()))?;
        if let Some(row) = state.rows.get_mut(identity) {
            row.fields = fields.clone();
            row.version = new_version;
        }
        trace!(%identity, %new_version, "memory update");
        Ok(new_version)
    }

    fn delete(&self, identity: &Identity, expected: Version) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.stats.deletes += 1;
        state.check_version(identity, expected)?;
        state.rows.remove(identity);
        trace!(%identity, "memory delete");
        Ok(())
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::FieldValue;

    fn price(p: f64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("price".into(), FieldValue::Float(p));
        fields
    }

    #[test]
    fn generated_keys_are_sequential_per_type() {
        let storage = MemoryStorage::new();
        let (a, _) = storage.insert(&"Order".into(), None, &price(1.0)).unwrap();
        let (b, _) = storage.insert(&"Order".into(), None, &price(2.0)).unwrap();
        let (c, _) = storage.insert(&"Product".into(), None, &price(3.0)).unwrap();
        assert_eq!(a, Identity::new("Order", 1));
        assert_eq!(b, Identity::new("Order", 2));
        assert_eq!(c, Identity::new("Product", 1));
    }

    #[test]
    fn generated_keys_skip_client_assigned_ones() {
        let storage = MemoryStorage::new();
        storage.insert(&"Order".into(), Some(Key::Int(1)), &price(1.0)).unwrap();
        let (generated, _) = storage.insert(&"Order".into(), None, &price(2.0)).unwrap();
        assert_eq!(generated, Identity::new("Order", 2));
    }

    #[test]
    fn duplicate_key_rejected() {
        let storage = MemoryStorage::new();
        storage.insert(&"Order".into(), Some(Key::Int(1)), &price(1.0)).unwrap();
        let err = storage
            .insert(&"Order".into(), Some(Key::Int(1)), &price(1.0))
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(id) if id == Identity::new("Order", 1)));
    }

    #[test]
    fn conditional_update_bumps_version_once() {
        let storage = MemoryStorage::new();
        let (id, v0) = storage.insert(&"Product".into(), None, &price(100.0)).unwrap();
        let v1 = storage.conditional_update(&id, v0, &price(1100.0)).unwrap();
        assert_eq!(v1, Version::new(1));
        let row = storage.read(&id).unwrap().unwrap();
        assert_eq!(row.version, Version::new(1));
        assert_eq!(row.fields, price(1100.0));
    }

    #[test]
    fn stale_update_reports_actual_version() {
        let storage = MemoryStorage::new();
        let (id, v0) = storage.insert(&"Product".into(), None, &price(100.0)).unwrap();
        storage.conditional_update(&id, v0, &price(1100.0)).unwrap();
        let err = storage.conditional_update(&id, v0, &price(1100.0)).unwrap_err();
        match err {
            StorageError::VersionMismatch { identity, expected, actual } => {
                assert_eq!(identity, id);
                assert_eq!(expected, Version::new(0));
                assert_eq!(actual, Some(Version::new(1)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn delete_is_version_checked() {
        let storage = MemoryStorage::new();
        let (id, v0) = storage.insert(&"Product".into(), None, &price(1.0)).unwrap();
        assert!(storage.delete(&id, Version::new(1)).is_err());
        storage.delete(&id, v0).unwrap();
        assert!(storage.read(&id).unwrap().is_none());
        let err = storage.conditional_update(&id, v0, &price(2.0)).unwrap_err();
        assert!(matches!(err, StorageError::VersionMismatch { actual: None, .. }));
    }

    #[test]
    fn stats_count_each_call() {
        let storage = MemoryStorage::new();
        let (id, v0) = storage.insert(&"Order".into(), None, &price(1.0)).unwrap();
        storage.read(&id).unwrap();
        storage.conditional_update(&id, v0, &price(2.0)).unwrap();
        let stats = storage.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes(), 2);
        storage.reset_stats();
        assert_eq!(storage.stats(), StorageStats::default());
    }

    #[test]
    fn update_past_largest_version_is_rejected() {
        let storage = MemoryStorage::new();
        let (id, _) = storage.insert(&"Order".into(), None, &price(1.0)).unwrap();
        let top = Version::new(u64::MAX);
        if let Some(row) = storage.state.lock().rows.get_mut(&id) {
            row.version = top;
        }
        let err = storage.conditional_update(&id, top, &price(2.0)).unwrap_err();
        assert!(matches!(err, StorageError::VersionOverflow(_)));
        assert_eq!(storage.version_of(&id), Some(top));
    }
}
