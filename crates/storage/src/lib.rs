pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use memory::{MemoryStorage, StorageStats};
pub use sqlite::SqliteStorage;
pub use traits::*;
