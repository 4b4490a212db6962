//! Snapshot-based dirty checking.
//!
//! A record is dirty when any field differs from the snapshot taken at load
//! time (or after its last write-back). Fields are compared by value using
//! `FieldValue`'s exact equality:
//!
//! - Floats are compared bit-for-bit through `total_cmp`. A price recomputed
//!   as `0.1 + 0.2` is dirty against a stored `0.3`; callers that round
//!   should round before assigning.
//! - Only state inside the record is observed. Anything the caller keeps
//!   elsewhere and mutates in place is invisible here.
//! - The record's version is not a tracked field. Overwriting it never makes
//!   a record dirty, and it is never used as the expected version.

use unitwork_core::{AttributeClassification, EntityRecord, FieldMap, FieldValue, Version};

/// Last-known persisted state of a cached row.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: Version,
    fields: FieldMap,
}

impl Snapshot {
    pub(crate) fn new(version: Version, fields: FieldMap) -> Self {
        Self { version, fields }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}

/// One changed field between a snapshot and the current record.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyField {
    pub name: String,
    pub classification: AttributeClassification,
    /// `None` when the field was added since the snapshot.
    pub before: Option<FieldValue>,
    /// `None` when the field was removed since the snapshot.
    pub after: Option<FieldValue>,
}

pub fn snapshot(record: &EntityRecord) -> Snapshot {
    Snapshot::new(record.version(), record.fields().clone())
}

pub fn is_dirty(record: &EntityRecord, snapshot: &Snapshot) -> bool {
    record.fields() != snapshot.fields()
}

/// Field-level diff, in field name order.
pub fn dirty_fields(record: &EntityRecord, snapshot: &Snapshot) -> Vec<DirtyField> {
    let current = record.fields();
    let previous = snapshot.fields();
    let mut changed = Vec::new();

    for (name, after) in current {
        match previous.get(name) {
            Some(before) if before == after => {}
            before => changed.push(DirtyField {
                name: name.clone(),
                classification: after.classification(),
                before: before.cloned(),
                after: Some(after.clone()),
            }),
        }
    }
    for (name, before) in previous {
        if !current.contains_key(name) {
            changed.push(DirtyField {
                name: name.clone(),
                classification: before.classification(),
                before: Some(before.clone()),
                after: None,
            });
        }
    }

    changed.sort_by(|a, b| a.name.cmp(&b.name));
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::Identity;

    fn order() -> EntityRecord {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), "taobao".into());
        fields.insert("price".into(), FieldValue::Float(100.0));
        EntityRecord::loaded(Identity::new("Order", 1), Version::new(0), fields)
    }

    #[test]
    fn untouched_record_is_clean() {
        let record = order();
        let snap = snapshot(&record);
        assert!(!is_dirty(&record, &snap));
        assert!(dirty_fields(&record, &snap).is_empty());
    }

    #[test]
    fn setting_the_same_value_is_clean() {
        let mut record = order();
        let snap = snapshot(&record);
        record.set("price", 100.0);
        assert!(!is_dirty(&record, &snap));
    }

    #[test]
    fn changed_field_is_reported() {
        let mut record = order();
        let snap = snapshot(&record);
        record.set("price", 1100.0);
        assert!(is_dirty(&record, &snap));
        let diff = dirty_fields(&record, &snap);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "price");
        assert_eq!(diff[0].classification, AttributeClassification::Basic);
        assert_eq!(diff[0].before, Some(FieldValue::Float(100.0)));
        assert_eq!(diff[0].after, Some(FieldValue::Float(1100.0)));
    }

    #[test]
    fn added_and_removed_fields_count() {
        let mut record = order();
        let snap = snapshot(&record);
        record.remove("name");
        record.set(
            "customer",
            FieldValue::ManyToOne(Identity::new("Customer", 3)),
        );
        let diff = dirty_fields(&record, &snap);
        let names: Vec<_> = diff.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["customer", "name"]);
        assert_eq!(diff[0].classification, AttributeClassification::ManyToOne);
        assert_eq!(diff[0].before, None);
        assert_eq!(diff[1].after, None);
    }

    #[test]
    fn version_overwrite_is_not_dirty() {
        let mut record = order();
        let snap = snapshot(&record);
        record.set_version(Version::new(5));
        assert!(!is_dirty(&record, &snap));
        assert_eq!(snap.version(), Version::new(0));
    }

    #[test]
    fn float_noise_is_dirty() {
        let mut fields = FieldMap::new();
        fields.insert("price".into(), FieldValue::Float(0.3));
        let mut record = EntityRecord::loaded(Identity::new("Order", 1), Version::new(0), fields);
        let snap = snapshot(&record);
        record.set("price", 0.1 + 0.2);
        assert!(is_dirty(&record, &snap));
    }

    #[test]
    fn nested_collection_change_is_dirty() {
        let mut record = order();
        record.set("tags", FieldValue::Collection(vec!["a".into()]));
        let snap = snapshot(&record);
        record.set("tags", FieldValue::Collection(vec!["a".into(), "b".into()]));
        let diff = dirty_fields(&record, &snap);
        assert_eq!(diff[0].classification, AttributeClassification::Collection);
    }
}
