//! Client for the code-review API.
//!
//! [`ReviewClient`] talks HTTP and always answers with a
//! [`ServiceResponse`](crate::query::ServiceResponse). [`ReviewQueries`]
//! puts those calls behind the query cache.

mod client;
mod queries;
mod types;

#[cfg(test)]
mod fixtures;

pub use client::ReviewClient;
pub use queries::{keys, ReviewQueries};
pub use types::*;
