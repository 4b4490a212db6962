use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::{FieldMap, FieldValue};
use crate::ids::{EntityType, Identity, Key, Version};

/// A versioned row as the application sees it.
///
/// A fresh record has no identity until it is saved (or was given a
/// client-assigned key). The version field is plain data here: writing it
/// has no bearing on optimistic lock checks, which use the version captured
/// when the row was loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    entity_type: EntityType,
    identity: Option<Identity>,
    version: Version,
    fields: FieldMap,
}

impl EntityRecord {
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            identity: None,
            version: Version::INITIAL,
            fields: FieldMap::new(),
        }
    }

    /// A fresh record whose primary key is chosen by the caller.
    pub fn with_key(entity_type: impl Into<EntityType>, key: impl Into<Key>) -> Self {
        let entity_type = entity_type.into();
        Self {
            identity: Some(Identity::new(entity_type.clone(), key)),
            entity_type,
            version: Version::INITIAL,
            fields: FieldMap::new(),
        }
    }

    pub fn loaded(identity: Identity, version: Version, fields: FieldMap) -> Self {
        Self {
            entity_type: identity.entity_type().clone(),
            identity: Some(identity),
            version,
            fields,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.fields.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Attach the identity produced by an insert. Identities never change
    /// once assigned.
    pub fn assign_identity(&mut self, identity: Identity) -> Result<(), CoreError> {
        if let Some(existing) = &self.identity {
            return Err(CoreError::IdentityAlreadyAssigned(existing.to_string()));
        }
        if identity.entity_type() != &self.entity_type {
            return Err(CoreError::InvalidData(format!(
                "identity {identity} does not belong to entity type {}",
                self.entity_type
            )));
        }
        self.identity = Some(identity);
        Ok(())
    }
}
