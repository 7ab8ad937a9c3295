//! Query cache for remote resources.
//!
//! Inspired by TanStack Query: a query is a composite [`QueryKey`] plus a
//! fetcher. The shared [`QueryClient`] keeps one entry per key and
//! - answers from cache while the entry is fresh,
//! - runs at most one fetch per key at a time,
//! - keeps the last good data when a later fetch fails,
//! - exposes `{ data, is_loading, error }` through [`QueryResult`].
//!
//! [`QueryObserver`] binds one consumer to a key that may change over time.
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new();
//! let key = query_key!["project", 42, "pr", 7, "details"];
//!
//! let details = client
//!     .fetch_query(
//!         &key,
//!         move || async move { api.pr_details(42, 7).await.into_fetch_result() },
//!         QueryOptions::new().stale_time(Duration::from_secs(180)),
//!     )
//!     .await;
//!
//! match details.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render(details.data()),
//!     QueryStatus::Error => render_error(details.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

mod client;
mod clock;
mod key;
mod observer;
mod options;
mod policy;
mod result;

pub use client::{CacheStats, EntryInfo, QueryClient, QueryClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{KeySegment, QueryKey};
pub use observer::QueryObserver;
pub use options::QueryOptions;
pub use policy::{with_retry, with_timeout, RetryPolicy};
pub use result::{FetchResult, QueryError, QueryResult, QueryStatus, ServiceResponse};
