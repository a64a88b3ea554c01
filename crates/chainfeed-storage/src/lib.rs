//! chainfeed-storage: pluggable document store backends for ChainFeed.
//!
//! Backends:
//! - memory: [`MemoryDocumentStore`], re-exported from `chainfeed-core`
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use chainfeed_core::store::MemoryDocumentStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDocumentStore;
