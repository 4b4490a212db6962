use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, trace};

use unitwork_core::{EntityType, FieldMap, Identity, Key, Version};

use crate::error::StorageError;
use crate::traits::{StorageBackend, StoredRow};

fn encode_key(key: &Key) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(key).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn encode_fields(fields: &FieldMap) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(fields).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_fields(bytes: &[u8]) -> Result<FieldMap, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn to_version(raw: i64) -> Result<Version, StorageError> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| StorageError::Serialization(format!("negative version {raw}")))
}

fn from_version(version: Version) -> Result<i64, StorageError> {
    i64::try_from(version.get())
        .map_err(|_| StorageError::Serialization(format!("version {version} out of range")))
}

/// SQLite-backed store. Keys and field maps are stored as MessagePack blobs.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        debug!(path, "opened sqlite storage");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn stored_version(
    tx: &Transaction,
    entity_type: &str,
    key: &[u8],
) -> Result<Option<Version>, StorageError> {
    let raw: Option<i64> = tx
        .query_row(
            "SELECT version FROM entities WHERE entity_type = ?1 AND key = ?2",
            rusqlite::params![entity_type, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(to_version).transpose()
}

/// Next generated integer key for `entity_type`, skipping keys already
/// taken by client-assigned inserts.
fn next_generated_key(tx: &Transaction, entity_type: &EntityType) -> Result<Key, StorageError> {
    let mut last: i64 = tx
        .query_row(
            "SELECT last_value FROM sequences WHERE entity_type = ?1",
            rusqlite::params![entity_type.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    loop {
        last += 1;
        let key = Key::Int(last);
        if stored_version(tx, entity_type.as_str(), &encode_key(&key)?)?.is_none() {
            tx.execute(
                "INSERT INTO sequences (entity_type, last_value) VALUES (?1, ?2)
                 ON CONFLICT(entity_type) DO UPDATE SET last_value = excluded.last_value",
                rusqlite::params![entity_type.as_str(), last],
            )?;
            return Ok(key);
        }
    }
}

impl StorageBackend for SqliteStorage {
    fn read(&self, identity: &Identity) -> Result<Option<StoredRow>, StorageError> {
        let conn = self.conn.lock();
        let key = encode_key(identity.key())?;
        let raw: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT version, fields FROM entities WHERE entity_type = ?1 AND key = ?2",
                rusqlite::params![identity.entity_type().as_str(), key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        trace!(%identity, found = raw.is_some(), "sqlite read");
        match raw {
            Some((version, fields)) => Ok(Some(StoredRow {
                fields: decode_fields(&fields)?,
                version: to_version(version)?,
            })),
            None => Ok(None),
        }
    }

    fn insert(
        &self,
        entity_type: &EntityType,
        key: Option<Key>,
        fields: &FieldMap,
    ) -> Result<(Identity, Version), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = match key {
            Some(key) => key,
            None => next_generated_key(&tx, entity_type)?,
        };
        let identity = Identity::new(entity_type.clone(), key);
        let result = tx.execute(
            "INSERT INTO entities (entity_type, key, version, fields) VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![
                entity_type.as_str(),
                encode_key(identity.key())?,
                encode_fields(fields)?,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::AlreadyExists(identity));
            }
            Err(e) => return Err(StorageError::Sqlite(e)),
        }
        tx.commit()?;
        trace!(%identity, "sqlite insert");
        Ok((identity, Version::INITIAL))
    }

    fn conditional_update(
        &self,
        identity: &Identity,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<Version, StorageError> {
        let new_version = expected
            .next()
            .filter(|v| i64::try_from(v.get()).is_ok())
            .ok_or_else(|| StorageError::VersionOverflow(identity.clone()))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = encode_key(identity.key())?;
        let changed = tx.execute(
            "UPDATE entities SET fields = ?1, version = ?5
             WHERE entity_type = ?2 AND key = ?3 AND version = ?4",
            rusqlite::params![
                encode_fields(fields)?,
                identity.entity_type().as_str(),
                key,
                from_version(expected)?,
                from_version(new_version)?,
            ],
        )?;
        if changed == 0 {
            let actual = stored_version(&tx, identity.entity_type().as_str(), &key)?;
            return Err(StorageError::VersionMismatch {
                identity: identity.clone(),
                expected,
                actual,
            });
        }
        tx.commit()?;
        trace!(%identity, %new_version, "sqlite update");
        Ok(new_version)
    }

    fn delete(&self, identity: &Identity, expected: Version) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = encode_key(identity.key())?;
        let changed = tx.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND key = ?2 AND version = ?3",
            rusqlite::params![identity.entity_type().as_str(), key, from_version(expected)?],
        )?;
        if changed == 0 {
            let actual = stored_version(&tx, identity.entity_type().as_str(), &key)?;
            return Err(StorageError::VersionMismatch {
                identity: identity.clone(),
                expected,
                actual,
            });
        }
        tx.commit()?;
        trace!(%identity, "sqlite delete");
        Ok(())
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
