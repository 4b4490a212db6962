use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeClassification;
use crate::ids::Identity;

pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    Bytes(Vec<u8>),
    Embedded(FieldMap),
    Collection(Vec<FieldValue>),
    ManyToOne(Identity),
    OneToOne(Identity),
    Any(Identity),
}

/// Exact equality. Floats use `total_cmp`, so `NaN` equals itself and
/// `0.0` differs from `-0.0`; no epsilon is applied.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Embedded(a), Self::Embedded(b)) => a == b,
            (Self::Collection(a), Self::Collection(b)) => a == b,
            (Self::ManyToOne(a), Self::ManyToOne(b)) => a == b,
            (Self::OneToOne(a), Self::OneToOne(b)) => a == b,
            (Self::Any(a), Self::Any(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn classification(&self) -> AttributeClassification {
        match self {
            FieldValue::Null
            | FieldValue::Text(_)
            | FieldValue::Integer(_)
            | FieldValue::Float(_)
            | FieldValue::Boolean(_)
            | FieldValue::Timestamp(_)
            | FieldValue::Bytes(_) => AttributeClassification::Basic,
            FieldValue::Embedded(_) => AttributeClassification::Embedded,
            FieldValue::Collection(_) => AttributeClassification::Collection,
            FieldValue::ManyToOne(_) => AttributeClassification::ManyToOne,
            FieldValue::OneToOne(_) => AttributeClassification::OneToOne,
            FieldValue::Any(_) => AttributeClassification::Any,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Integer(n.into())
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Float(x)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}
