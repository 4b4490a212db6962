use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use unitwork_core::{EntityRecord, EntityType, FieldMap, Identity, Key, SessionId, Version};
use unitwork_storage::StorageBackend;

use crate::cache::IdentityCache;
use crate::config::SessionConfig;
use crate::context::{AbortHandle, ContextShared, SessionStatus};
use crate::entity::EntityRef;
use crate::error::SessionError;
use crate::lock::OptimisticLockCoordinator;

/// Opens sessions against one shared backend.
pub struct SessionFactory {
    backend: Arc<dyn StorageBackend>,
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new<B: StorageBackend + 'static>(backend: Arc<B>) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    pub fn with_config<B: StorageBackend + 'static>(backend: Arc<B>, config: SessionConfig) -> Self {
        let backend: Arc<dyn StorageBackend> = backend;
        Self { backend, config }
    }

    pub fn open_session(&self) -> Session {
        Session::open(self.backend.clone(), self.config.clone())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// What a flush wrote, in the order it was written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: Vec<Identity>,
    pub updated: Vec<(Identity, Version)>,
    pub deleted: Vec<Identity>,
}

impl FlushSummary {
    pub fn writes(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes() == 0
    }
}

enum PlannedWrite {
    Insert(EntityRef),
    Update {
        entity: EntityRef,
        expected: Version,
        fields: FieldMap,
    },
    Delete { identity: Identity, expected: Version },
}

impl PlannedWrite {
    fn identity(&self) -> &Identity {
        match self {
            PlannedWrite::Insert(entity) | PlannedWrite::Update { entity, .. } => entity.identity(),
            PlannedWrite::Delete { identity, .. } => identity,
        }
    }
}

/// Unit-of-work persistence context.
///
/// Caches one instance per identity, snapshots what it loads, and writes
/// changed instances back with version checks when flushed or committed.
/// Nothing is written on mutation: write-back happens only in
/// [`Session::flush`] and [`Session::commit`].
///
/// Write order within a flush is fixed: inserts of client-keyed records,
/// then updates, then deletes, each group in ascending identity order. The
/// first failing write stops the flush; earlier writes stay applied.
pub struct Session {
    shared: Arc<ContextShared>,
    config: SessionConfig,
    cache: IdentityCache,
    pending_inserts: BTreeSet<Identity>,
    deletions: BTreeMap<Identity, Version>,
    lock: OptimisticLockCoordinator,
}

impl Session {
    pub fn open(backend: Arc<dyn StorageBackend>, config: SessionConfig) -> Self {
        let shared = Arc::new(ContextShared::new(backend.clone(), &config));
        let lock = OptimisticLockCoordinator::new(shared.session_id, backend);
        debug!(session = %shared.session_id, "session opened");
        Self {
            shared,
            config,
            cache: IdentityCache::new(),
            pending_inserts: BTreeSet::new(),
            deletions: BTreeMap::new(),
            lock,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.shared.clone())
    }

    /// Number of instances currently cached.
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn ensure_open(&mut self) -> Result<(), SessionError> {
        if self.shared.abort_requested() && self.status() != SessionStatus::Closed {
            warn!(session = %self.id(), "closing aborted session");
            self.close();
        }
        match self.status() {
            SessionStatus::Open => Ok(()),
            SessionStatus::Closed | SessionStatus::RolledBack => Err(SessionError::SessionClosed),
            status => Err(SessionError::InvalidState(format!(
                "session is {}",
                status.as_str()
            ))),
        }
    }

    fn ensure_capacity(&self) -> Result<(), SessionError> {
        match self.config.max_entities {
            Some(limit) if self.cache.len() >= limit => Err(SessionError::InvalidState(format!(
                "session already holds {limit} entities"
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_managed(&self, entity: &EntityRef) -> Result<(), SessionError> {
        if self.cache.holds(entity) {
            Ok(())
        } else {
            Err(SessionError::NotManaged(entity.identity().clone()))
        }
    }

    /// Return the cached instance, or read the row and cache it.
    /// A missing row is reported as `NotFound` and nothing is cached.
    pub fn get(
        &mut self,
        entity_type: impl Into<EntityType>,
        key: impl Into<Key>,
    ) -> Result<EntityRef, SessionError> {
        self.ensure_open()?;
        let identity = Identity::new(entity_type, key);
        if self.deletions.contains_key(&identity) {
            return Err(SessionError::NotFound(identity));
        }
        if let Some(entity) = self.cache.get(&identity) {
            debug!(session = %self.id(), %identity, "cache hit");
            entity.initialize()?;
            return Ok(entity.clone());
        }

        debug!(session = %self.id(), %identity, "cache miss");
        let row = self
            .shared
            .backend
            .read(&identity)?
            .ok_or_else(|| SessionError::NotFound(identity.clone()))?;
        self.ensure_capacity()?;
        let record = EntityRecord::loaded(identity.clone(), row.version, row.fields);
        let entity = EntityRef::persisted(record, self.shared.clone())?;
        self.cache.put(identity, entity.clone())?;
        Ok(entity)
    }

    /// Return a reference without touching storage. Existence is checked
    /// when a field is first accessed.
    pub fn load(
        &mut self,
        entity_type: impl Into<EntityType>,
        key: impl Into<Key>,
    ) -> Result<EntityRef, SessionError> {
        self.ensure_open()?;
        let identity = Identity::new(entity_type, key);
        if self.deletions.contains_key(&identity) {
            return Err(SessionError::NotFound(identity));
        }
        if let Some(entity) = self.cache.get(&identity) {
            debug!(session = %self.id(), %identity, "cache hit");
            return Ok(entity.clone());
        }

        self.ensure_capacity()?;
        debug!(session = %self.id(), %identity, "created proxy");
        let entity = EntityRef::proxy(identity.clone(), self.shared.clone());
        self.cache.put(identity, entity.clone())?;
        Ok(entity)
    }

    /// Make a new record persistent.
    ///
    /// Without an identity the row is inserted immediately so the backend
    /// can generate its key. With a client-assigned identity the insert is
    /// deferred to the next flush.
    pub fn save(&mut self, mut record: EntityRecord) -> Result<EntityRef, SessionError> {
        self.ensure_open()?;
        self.ensure_capacity()?;
        record.set_version(Version::INITIAL);

        match record.identity().cloned() {
            None => {
                let (identity, version) = self.insert_generated(&record)?;
                record.assign_identity(identity.clone())?;
                record.set_version(version);
                debug!(session = %self.id(), %identity, "inserted");
                let entity = EntityRef::persisted(record, self.shared.clone())?;
                self.cache.put(identity, entity.clone())?;
                Ok(entity)
            }
            Some(identity) => {
                if self.cache.contains(&identity) || self.deletions.contains_key(&identity) {
                    return Err(SessionError::DuplicateIdentity(identity));
                }
                debug!(session = %self.id(), %identity, "insert scheduled");
                let entity = EntityRef::pending(record, self.shared.clone())?;
                self.cache.put(identity.clone(), entity.clone())?;
                self.pending_inserts.insert(identity);
                Ok(entity)
            }
        }
    }

    /// Insert with a backend-generated key that no instance in this session
    /// already claims. A colliding row (a pending client key, or a proxy for
    /// a row that did not exist yet) is deleted again and another key drawn.
    fn insert_generated(&self, record: &EntityRecord) -> Result<(Identity, Version), SessionError> {
        let backend = &self.shared.backend;
        for _ in 0..=self.cache.len() {
            let (identity, version) = backend.insert(record.entity_type(), None, record.fields())?;
            if !self.cache.contains(&identity) {
                return Ok((identity, version));
            }
            debug!(session = %self.id(), %identity, "generated key already claimed, retrying");
            backend.delete(&identity, version)?;
        }
        Err(SessionError::InvalidState(format!(
            "backend kept generating claimed keys for {}",
            record.entity_type()
        )))
    }

    /// Schedule a version-checked delete for the next flush. A record whose
    /// insert is still pending is simply forgotten.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.ensure_managed(entity)?;
        let identity = entity.identity().clone();

        if self.pending_inserts.remove(&identity) {
            self.cache.remove(&identity);
            entity.detach();
            debug!(session = %self.id(), %identity, "dropped pending insert");
            return Ok(());
        }

        entity.initialize()?;
        let expected = entity.snapshot_version().ok_or_else(|| {
            SessionError::InvalidState(format!("{identity} has no snapshot"))
        })?;
        self.cache.remove(&identity);
        entity.detach();
        debug!(session = %self.id(), %identity, %expected, "delete scheduled");
        self.deletions.insert(identity, expected);
        Ok(())
    }

    /// Re-read the row, discarding local changes to this instance.
    pub fn refresh(&mut self, entity: &EntityRef) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.ensure_managed(entity)?;
        let identity = entity.identity();
        if self.pending_inserts.contains(identity) {
            return Err(SessionError::InvalidState(format!(
                "{identity} has not been inserted yet"
            )));
        }
        let row = self
            .shared
            .backend
            .read(identity)?
            .ok_or_else(|| SessionError::NotFound(identity.clone()))?;
        debug!(session = %self.id(), %identity, version = %row.version, "refreshed");
        entity.reset(row);
        Ok(())
    }

    /// Stop tracking one instance. A pending insert for it is cancelled.
    pub fn evict(&mut self, entity: &EntityRef) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.ensure_managed(entity)?;
        let identity = entity.identity();
        self.cache.remove(identity);
        self.pending_inserts.remove(identity);
        entity.detach();
        debug!(session = %self.id(), %identity, "evicted");
        Ok(())
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.cache.holds(entity)
    }

    /// Detach everything and forget pending work, keeping the session open.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }

    /// Whether a flush would write anything.
    pub fn is_dirty(&mut self) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(!self.plan_writes()?.is_empty())
    }

    /// Write pending changes now and keep the session open.
    ///
    /// On failure the session moves to `Failed`; it can then only be rolled
    /// back or closed.
    pub fn flush(&mut self) -> Result<FlushSummary, SessionError> {
        self.ensure_open()?;
        match self.write_back() {
            Ok(summary) => Ok(summary),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Write pending changes and close the session.
    pub fn commit(&mut self) -> Result<FlushSummary, SessionError> {
        self.ensure_open()?;
        self.shared.set_status(SessionStatus::Committing);
        match self.write_back() {
            Ok(summary) => {
                info!(
                    session = %self.id(),
                    inserted = summary.inserted.len(),
                    updated = summary.updated.len(),
                    deleted = summary.deleted.len(),
                    "committed"
                );
                self.close();
                Ok(summary)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Discard pending work and close. Nothing already flushed is undone.
    pub fn rollback(&mut self) -> Result<(), SessionError> {
        match self.status() {
            SessionStatus::Closed | SessionStatus::RolledBack => Err(SessionError::SessionClosed),
            _ => {
                self.shared.set_status(SessionStatus::RolledBack);
                debug!(session = %self.id(), "rolled back");
                self.close();
                Ok(())
            }
        }
    }

    /// Discard cache and snapshots. Every later operation fails with
    /// `SessionClosed`; calling it again is a no-op.
    pub fn close(&mut self) {
        if self.status() == SessionStatus::Closed {
            return;
        }
        self.discard();
        self.shared.set_status(SessionStatus::Closed);
        debug!(session = %self.id(), "session closed");
    }

    fn discard(&mut self) {
        for entity in self.cache.drain() {
            entity.detach();
        }
        self.pending_inserts.clear();
        self.deletions.clear();
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        if matches!(err, SessionError::Aborted { .. }) {
            self.close();
        } else {
            warn!(session = %self.id(), error = %err, "write-back failed");
            self.shared.set_status(SessionStatus::Failed);
        }
        err
    }

    fn plan_writes(&self) -> Result<Vec<PlannedWrite>, SessionError> {
        let mut plan = Vec::new();

        for identity in &self.pending_inserts {
            let entity = self.cache.get(identity).ok_or_else(|| {
                SessionError::InvalidState(format!("pending insert {identity} is not cached"))
            })?;
            plan.push(PlannedWrite::Insert(entity.clone()));
        }

        for (identity, entity) in self.cache.iter() {
            if self.pending_inserts.contains(identity) {
                continue;
            }
            if let Some(update) = entity.pending_update() {
                let changed: Vec<String> = update
                    .changed
                    .iter()
                    .map(|f| format!("{}:{}", f.name, f.classification))
                    .collect();
                debug!(session = %self.id(), %identity, ?changed, "dirty");
                plan.push(PlannedWrite::Update {
                    entity: entity.clone(),
                    expected: update.expected,
                    fields: update.fields,
                });
            }
        }

        for (identity, expected) in &self.deletions {
            plan.push(PlannedWrite::Delete {
                identity: identity.clone(),
                expected: *expected,
            });
        }

        Ok(plan)
    }

    fn write_back(&mut self) -> Result<FlushSummary, SessionError> {
        let plan = self.plan_writes()?;
        let mut summary = FlushSummary::default();
        let mut applied: Vec<Identity> = Vec::new();

        for write in plan {
            if self.shared.abort_requested() {
                warn!(session = %self.id(), applied = applied.len(), "write-back aborted");
                return Err(SessionError::Aborted { applied });
            }
            let identity = write.identity().clone();
            if let Err(err) = self.apply(write, &mut summary) {
                if applied.is_empty() {
                    return Err(err);
                }
                return Err(SessionError::PartialCommit {
                    applied,
                    source: Box::new(err),
                });
            }
            applied.push(identity);
        }

        Ok(summary)
    }

    fn apply(&mut self, write: PlannedWrite, summary: &mut FlushSummary) -> Result<(), SessionError> {
        match write {
            PlannedWrite::Insert(entity) => {
                let (entity_type, key, fields) = entity.insert_payload().ok_or_else(|| {
                    SessionError::InvalidState(format!("{} has no state", entity.identity()))
                })?;
                let (identity, version) =
                    self.shared.backend.insert(&entity_type, Some(key), &fields)?;
                entity.mark_written(version, fields);
                self.pending_inserts.remove(&identity);
                summary.inserted.push(identity);
            }
            PlannedWrite::Update {
                entity,
                expected,
                fields,
            } => {
                let identity = entity.identity().clone();
                let version = self.lock.conditional_write(&identity, expected, &fields)?;
                entity.mark_written(version, fields);
                summary.updated.push((identity, version));
            }
            PlannedWrite::Delete { identity, expected } => {
                self.lock.conditional_delete(&identity, expected)?;
                self.deletions.remove(&identity);
                summary.deleted.push(identity);
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
