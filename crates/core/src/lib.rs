pub mod attribute;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod record;

pub use attribute::AttributeClassification;
pub use error::CoreError;
pub use field_value::{FieldMap, FieldValue};
pub use ids::*;
pub use record::EntityRecord;
