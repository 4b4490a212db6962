use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use unitwork_core::{EntityRecord, EntityType, FieldMap, FieldValue, Identity, Key, Version};
use unitwork_storage::StoredRow;

use crate::context::ContextShared;
use crate::dirty::{self, DirtyField, Snapshot};
use crate::error::SessionError;

/// Where a reference stands relative to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Handed out by `load`; the row has not been fetched yet.
    Unloaded,
    /// Holds row state and is tracked by an open session.
    Loaded,
    /// No longer tracked: the session closed, or the entity was evicted or
    /// deleted. State fetched before detaching stays readable.
    Detached,
}

/// Arena entry behind an [`EntityRef`]. The snapshot belongs to the session
/// and is never exposed through the reference.
struct Slot {
    state: ProxyState,
    record: Option<EntityRecord>,
    snapshot: Option<Snapshot>,
}

struct EntityCell {
    identity: Identity,
    context: Arc<ContextShared>,
    slot: Mutex<Slot>,
}

/// Handle to the single in-memory instance a session keeps for one row.
///
/// Clones share the same instance; mutations through any clone are seen by
/// the session at flush time. Closures passed to [`EntityRef::with_record`]
/// and [`EntityRef::update`] must not call back into the same reference.
#[derive(Clone)]
pub struct EntityRef {
    inner: Arc<EntityCell>,
}

/// Write the session owes for one dirty entity.
pub(crate) struct PendingUpdate {
    pub expected: Version,
    pub fields: FieldMap,
    pub changed: Vec<DirtyField>,
}

impl EntityRef {
    fn from_slot(identity: Identity, context: Arc<ContextShared>, slot: Slot) -> Self {
        Self {
            inner: Arc::new(EntityCell {
                identity,
                context,
                slot: Mutex::new(slot),
            }),
        }
    }

    /// Uninitialized proxy; the row is fetched on first access.
    pub(crate) fn proxy(identity: Identity, context: Arc<ContextShared>) -> Self {
        Self::from_slot(
            identity,
            context,
            Slot {
                state: ProxyState::Unloaded,
                record: None,
                snapshot: None,
            },
        )
    }

    /// Instance whose record matches what storage holds.
    pub(crate) fn persisted(record: EntityRecord, context: Arc<ContextShared>) -> Result<Self, SessionError> {
        let identity = record
            .identity()
            .cloned()
            .ok_or_else(|| SessionError::InvalidState("persisted record has no identity".into()))?;
        let snapshot = dirty::snapshot(&record);
        Ok(Self::from_slot(
            identity,
            context,
            Slot {
                state: ProxyState::Loaded,
                record: Some(record),
                snapshot: Some(snapshot),
            },
        ))
    }

    /// Instance with a client-assigned key whose insert is still pending.
    pub(crate) fn pending(record: EntityRecord, context: Arc<ContextShared>) -> Result<Self, SessionError> {
        let identity = record
            .identity()
            .cloned()
            .ok_or_else(|| SessionError::InvalidState("pending record has no identity".into()))?;
        Ok(Self::from_slot(
            identity,
            context,
            Slot {
                state: ProxyState::Loaded,
                record: Some(record),
                snapshot: None,
            },
        ))
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn state(&self) -> ProxyState {
        self.inner.slot.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.slot.lock().record.is_some()
    }

    /// True when both handles point at the same in-memory instance.
    pub fn same_instance(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn get(&self, field: &str) -> Result<Option<FieldValue>, SessionError> {
        self.with_record(|record| record.get(field).cloned())
    }

    /// Set a field, returning its previous value.
    pub fn set(
        &self,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Option<FieldValue>, SessionError> {
        let value = value.into();
        self.update(|record| record.set(field, value))
    }

    pub fn remove(&self, field: &str) -> Result<Option<FieldValue>, SessionError> {
        self.update(|record| record.remove(field))
    }

    /// The version held on the instance. After a manual `set_version` this
    /// is whatever the caller wrote, not the version used for lock checks.
    pub fn version(&self) -> Result<Version, SessionError> {
        self.with_record(|record| record.version())
    }

    pub fn set_version(&self, version: Version) -> Result<(), SessionError> {
        self.update(|record| record.set_version(version))
    }

    /// Copy of the current state.
    pub fn record(&self) -> Result<EntityRecord, SessionError> {
        self.with_record(|record| record.clone())
    }

    pub fn with_record<R>(&self, f: impl FnOnce(&EntityRecord) -> R) -> Result<R, SessionError> {
        let mut slot = self.inner.slot.lock();
        self.resolve(&mut slot)?;
        match slot.record.as_ref() {
            Some(record) => Ok(f(record)),
            None => Err(SessionError::LazyInitialization(self.identity().clone())),
        }
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut EntityRecord) -> R) -> Result<R, SessionError> {
        let mut slot = self.inner.slot.lock();
        self.resolve(&mut slot)?;
        match slot.record.as_mut() {
            Some(record) => Ok(f(record)),
            None => Err(SessionError::LazyInitialization(self.identity().clone())),
        }
    }

    /// Fetch the row now if this is an uninitialized proxy.
    pub(crate) fn initialize(&self) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock();
        self.resolve(&mut slot)
    }

    fn resolve(&self, slot: &mut Slot) -> Result<(), SessionError> {
        if slot.record.is_some() {
            return Ok(());
        }
        let context = &self.inner.context;
        let identity = &self.inner.identity;
        let attached = slot.state == ProxyState::Unloaded && context.is_open();
        if !attached && !context.lazy_load_no_trans {
            return Err(SessionError::LazyInitialization(identity.clone()));
        }

        let row = context
            .backend
            .read(identity)?
            .ok_or_else(|| SessionError::NotFound(identity.clone()))?;
        let record = EntityRecord::loaded(identity.clone(), row.version, row.fields);
        if attached {
            debug!(session = %context.session_id, %identity, version = %row.version, "initialized proxy");
            slot.snapshot = Some(dirty::snapshot(&record));
            slot.state = ProxyState::Loaded;
        } else {
            debug!(session = %context.session_id, %identity, "detached proxy read outside session");
            slot.state = ProxyState::Detached;
        }
        slot.record = Some(record);
        Ok(())
    }

    /// Version the row had when this session last synchronized with it.
    pub(crate) fn snapshot_version(&self) -> Option<Version> {
        self.inner.slot.lock().snapshot.as_ref().map(|s| s.version())
    }

    /// The update a flush must issue, if the instance changed since its snapshot.
    pub(crate) fn pending_update(&self) -> Option<PendingUpdate> {
        let slot = self.inner.slot.lock();
        if slot.state != ProxyState::Loaded {
            return None;
        }
        let (record, snapshot) = (slot.record.as_ref()?, slot.snapshot.as_ref()?);
        if !dirty::is_dirty(record, snapshot) {
            return None;
        }
        Some(PendingUpdate {
            expected: snapshot.version(),
            fields: record.fields().clone(),
            changed: dirty::dirty_fields(record, snapshot),
        })
    }

    /// Type, key and fields for a pending insert.
    pub(crate) fn insert_payload(&self) -> Option<(EntityType, Key, FieldMap)> {
        let slot = self.inner.slot.lock();
        let record = slot.record.as_ref()?;
        Some((
            record.entity_type().clone(),
            self.inner.identity.key().clone(),
            record.fields().clone(),
        ))
    }

    /// Record that `fields` were written at `version`.
    pub(crate) fn mark_written(&self, version: Version, fields: FieldMap) {
        let mut slot = self.inner.slot.lock();
        if let Some(record) = slot.record.as_mut() {
            record.set_version(version);
        }
        slot.snapshot = Some(Snapshot::new(version, fields));
    }

    /// Replace the instance state with a fresh read.
    pub(crate) fn reset(&self, row: StoredRow) {
        let mut slot = self.inner.slot.lock();
        slot.record = Some(EntityRecord::loaded(
            self.inner.identity.clone(),
            row.version,
            row.fields.clone(),
        ));
        slot.snapshot = Some(Snapshot::new(row.version, row.fields));
        slot.state = ProxyState::Loaded;
    }

    /// Stop tracking. The snapshot is dropped with the session's interest.
    pub(crate) fn detach(&self) {
        let mut slot = self.inner.slot.lock();
        slot.state = ProxyState::Detached;
        slot.snapshot = None;
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("EntityRef")
            .field("identity", &self.inner.identity)
            .field("state", &slot.state)
            .field("record", &slot.record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::context::SessionStatus;
    use unitwork_storage::{MemoryStorage, StorageBackend};

    fn context_with_row(config: SessionConfig) -> (Arc<MemoryStorage>, Arc<ContextShared>, Identity) {
        let storage = Arc::new(MemoryStorage::new());
        let mut fields = FieldMap::new();
        fields.insert("price".into(), FieldValue::Float(100.0));
        let (identity, _) = storage.insert(&"Product".into(), None, &fields).unwrap();
        let backend: Arc<dyn StorageBackend> = storage.clone();
        (storage, Arc::new(ContextShared::new(backend, &config)), identity)
    }

    #[test]
    fn proxy_fetches_on_first_access_only() {
        let (storage, context, identity) = context_with_row(SessionConfig::default());
        let proxy = EntityRef::proxy(identity, context);
        assert_eq!(proxy.state(), ProxyState::Unloaded);
        assert_eq!(storage.stats().reads, 0);

        assert_eq!(proxy.get("price").unwrap(), Some(FieldValue::Float(100.0)));
        assert_eq!(proxy.state(), ProxyState::Loaded);
        assert_eq!(proxy.snapshot_version(), Some(Version::new(0)));

        proxy.get("price").unwrap();
        assert_eq!(storage.stats().reads, 1);
    }

    #[test]
    fn proxy_for_missing_row_fails_at_access() {
        let (_, context, _) = context_with_row(SessionConfig::default());
        let proxy = EntityRef::proxy(Identity::new("Product", 99), context);
        assert!(matches!(proxy.get("price"), Err(SessionError::NotFound(_))));
        assert!(!proxy.is_initialized());
    }

    #[test]
    fn proxy_after_close_fails() {
        let (_, context, identity) = context_with_row(SessionConfig::default());
        let proxy = EntityRef::proxy(identity, context.clone());
        context.set_status(SessionStatus::Closed);
        assert!(matches!(
            proxy.get("price"),
            Err(SessionError::LazyInitialization(_))
        ));
    }

    #[test]
    fn detached_proxy_reads_when_allowed() {
        let config = SessionConfig::new().lazy_load_no_trans(true);
        let (_, context, identity) = context_with_row(config);
        let proxy = EntityRef::proxy(identity, context.clone());
        context.set_status(SessionStatus::Closed);
        assert_eq!(proxy.get("price").unwrap(), Some(FieldValue::Float(100.0)));
        assert_eq!(proxy.state(), ProxyState::Detached);
        assert!(proxy.pending_update().is_none());
    }

    #[test]
    fn pending_update_uses_snapshot_version() {
        let (_, context, identity) = context_with_row(SessionConfig::default());
        let entity = EntityRef::proxy(identity, context);
        entity.set("price", 1100.0).unwrap();
        entity.set_version(Version::new(5)).unwrap();

        let update = entity.pending_update().unwrap();
        assert_eq!(update.expected, Version::new(0));
        assert_eq!(update.changed.len(), 1);

        entity.mark_written(Version::new(1), update.fields);
        assert_eq!(entity.version().unwrap(), Version::new(1));
        assert!(entity.pending_update().is_none());
    }

    #[test]
    fn clones_share_one_instance() {
        let (_, context, identity) = context_with_row(SessionConfig::default());
        let a = EntityRef::proxy(identity, context);
        let b = a.clone();
        a.set("price", 5.0).unwrap();
        assert!(a.same_instance(&b));
        assert_eq!(b.get("price").unwrap(), Some(FieldValue::Float(5.0)));
    }
}
