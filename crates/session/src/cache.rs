use std::collections::BTreeMap;

use unitwork_core::Identity;

use crate::entity::EntityRef;
use crate::error::SessionError;

/// Per-session identity map: at most one instance per row.
///
/// Pure bookkeeping; it never talks to storage. Iteration is in ascending
/// identity order, which the session uses as its write order.
#[derive(Default)]
pub struct IdentityCache {
    entries: BTreeMap<Identity, EntityRef>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &Identity) -> Option<&EntityRef> {
        self.entries.get(identity)
    }

    pub fn put(&mut self, identity: Identity, entity: EntityRef) -> Result<(), SessionError> {
        if entity.identity() != &identity {
            return Err(SessionError::InvalidState(format!(
                "cannot cache {} under {identity}",
                entity.identity()
            )));
        }
        if self.entries.contains_key(&identity) {
            return Err(SessionError::DuplicateIdentity(identity));
        }
        self.entries.insert(identity, entity);
        Ok(())
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<EntityRef> {
        self.entries.remove(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// True when `entity` is the instance cached under its identity.
    pub fn holds(&self, entity: &EntityRef) -> bool {
        self.entries
            .get(entity.identity())
            .is_some_and(|cached| cached.same_instance(entity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &EntityRef)> {
        self.entries.iter()
    }

    /// Empty the cache, handing back every instance it held.
    pub fn drain(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
