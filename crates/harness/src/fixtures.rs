use std::sync::Arc;

use tempfile::TempDir;
use unitwork_core::{EntityType, FieldMap, FieldValue, Identity, Key, Version};
use unitwork_session::{Session, SessionConfig, SessionFactory};
use unitwork_storage::{MemoryStorage, SqliteStorage, StorageBackend, StorageError, StoredRow};

use crate::recording::RecordingStorage;

/// A backend with recorded calls and a session factory over it.
///
/// Seeding and inspection go straight to the wrapped backend, so the call
/// log only shows what sessions did.
pub struct TestDb {
    pub storage: Arc<RecordingStorage>,
    pub factory: SessionFactory,
    _dir: Option<TempDir>,
}

impl TestDb {
    pub fn memory() -> Self {
        Self::memory_with(SessionConfig::default())
    }

    pub fn memory_with(config: SessionConfig) -> Self {
        Self::build(Arc::new(MemoryStorage::new()), config, None)
    }

    /// SQLite file in a fresh temporary directory.
    pub fn sqlite() -> Result<Self, Box<dyn std::error::Error>> {
        Self::sqlite_with(SessionConfig::default())
    }

    pub fn sqlite_with(config: SessionConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("unitwork.db");
        let path = path.to_str().ok_or("temporary path is not valid UTF-8")?;
        let storage = SqliteStorage::open(path)?;
        Ok(Self::build(Arc::new(storage), config, Some(dir)))
    }

    fn build(backend: Arc<dyn StorageBackend>, config: SessionConfig, dir: Option<TempDir>) -> Self {
        let storage = Arc::new(RecordingStorage::new(backend));
        let factory = SessionFactory::with_config(storage.clone(), config);
        Self {
            storage,
            factory,
            _dir: dir,
        }
    }

    pub fn open_session(&self) -> Session {
        self.factory.open_session()
    }

    /// Insert a row at version 0 behind every session's back.
    pub fn seed(
        &self,
        entity_type: &str,
        key: impl Into<Key>,
        fields: Vec<(&str, FieldValue)>,
    ) -> Result<Identity, StorageError> {
        let fields: FieldMap = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let (identity, _) =
            self.storage
                .inner()
                .insert(&EntityType::from(entity_type), Some(key.into()), &fields)?;
        Ok(identity)
    }

    /// `Product#key` with a name and a price.
    pub fn seed_product(&self, key: i64, name: &str, price: f64) -> Result<Identity, StorageError> {
        self.seed(
            "Product",
            key,
            vec![("name", name.into()), ("price", FieldValue::Float(price))],
        )
    }

    /// `Order#key` with a name and a price.
    pub fn seed_order(&self, key: i64, name: &str, price: f64) -> Result<Identity, StorageError> {
        self.seed(
            "Order",
            key,
            vec![("name", name.into()), ("price", FieldValue::Float(price))],
        )
    }

    /// Current stored state, read without being recorded.
    pub fn stored(&self, identity: &Identity) -> Result<Option<StoredRow>, StorageError> {
        self.storage.inner().read(identity)
    }

    pub fn stored_version(&self, identity: &Identity) -> Result<Option<Version>, StorageError> {
        Ok(self.stored(identity)?.map(|row| row.version))
    }

    pub fn stored_field(&self, identity: &Identity, field: &str) -> Result<Option<FieldValue>, StorageError> {
        Ok(self
            .stored(identity)?
            .and_then(|row| row.fields.get(field).cloned()))
    }
}
