//! Core traits for cacheable payloads.

use serde::{de::DeserializeOwned, Serialize};

/// Trait for payloads that can live in the query cache.
///
/// Payloads are shared between every consumer of a key, and are serialized
/// to JSON when a persistent [`CacheStorage`](super::CacheStorage) is in use.
/// Implemented for every type meeting the bounds.
pub trait Cacheable: Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Send + Sync + Serialize + DeserializeOwned + 'static {}
