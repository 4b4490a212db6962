//! Unit-of-work sessions over a versioned row store.
//!
//! A [`Session`] keeps one instance per row identity, snapshots what it
//! loads, and writes changed rows back under optimistic locking when it is
//! flushed or committed.

pub mod cache;
pub mod config;
pub mod context;
pub mod dirty;
pub mod entity;
pub mod error;
pub mod lock;
pub mod session;

pub use cache::IdentityCache;
pub use config::SessionConfig;
pub use context::{AbortHandle, SessionStatus};
pub use dirty::{DirtyField, Snapshot};
pub use entity::{EntityRef, ProxyState};
pub use error::{Conflict, SessionError};
pub use lock::OptimisticLockCoordinator;
pub use session::{FlushSummary, Session, SessionFactory};
