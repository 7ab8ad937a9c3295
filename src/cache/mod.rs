//! Persistent second tier for the query cache.
//!
//! The in-memory [`QueryClient`](crate::query::QueryClient) is the source of
//! truth while the process runs. A storage backend lets successful payloads
//! outlive the process:
//! - Payloads are stored as JSON, keyed by the SHA-256 of the query key
//! - The fetch timestamp is kept so staleness carries across restarts
//! - Invalidation removes stored copies by key prefix

mod storage;
mod traits;

pub use storage::{CacheStorage, NoopStorage, SqliteStorage, StoredEntry};
pub use traits::Cacheable;
