use thiserror::Error;
use unitwork_core::{Identity, Version};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(Identity),

    #[error("row already exists: {0}")]
    AlreadyExists(Identity),

    #[error("version counter exhausted for {0}")]
    VersionOverflow(Identity),

    /// `actual` is `None` when the row no longer exists.
    #[error("version mismatch on {identity}: expected {expected}, found {}", display_actual(.actual))]
    VersionMismatch {
        identity: Identity,
        expected: Version,
        actual: Option<Version>,
    },
}

fn display_actual(actual: &Option<Version>) -> String {
    match actual {
        Some(v) => v.to_string(),
        None => "no row".to_string(),
    }
}
