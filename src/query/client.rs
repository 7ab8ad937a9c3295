//! Process-wide query cache.
//!
//! [`QueryClient`] owns one entry per [`QueryKey`]. A query is answered from
//! the entry while it is fresh, joins the fetch already in flight for its key,
//! or starts a new fetch on a spawned task. Only that task writes the outcome
//! back, so consumers can read entries but never mutate them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, Cacheable, NoopStorage};

use super::clock::{Clock, SystemClock};
use super::key::QueryKey;
use super::options::QueryOptions;
use super::result::{FetchResult, QueryError, QueryResult};

type Payload = Arc<dyn Any + Send + Sync>;
type FetchOutcome = Result<Payload, QueryError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// What [`QueryClient::start`] decided to do.
pub(crate) enum Begin {
  /// Disabled; nothing to do.
  Idle,
  /// The entry is fresh.
  Ready,
  /// A fetch is in flight (just started or joined).
  Pending(SharedFetch),
}

struct InFlight {
  id: u64,
  fetch: SharedFetch,
}

struct QueryEntry {
  /// Unique per entry; a fetch started for a removed entry never writes
  /// into a re-created one.
  id: u64,
  data: Option<Payload>,
  error: Option<QueryError>,
  last_success_at: Option<DateTime<Utc>>,
  /// Bumped by every invalidation.
  invalidation: u64,
  /// Newest invalidation the current data was fetched after.
  refreshed: u64,
  hydrated: bool,
  in_flight: Option<InFlight>,
  version: watch::Sender<u64>,
}

impl QueryEntry {
  fn new(id: u64) -> Self {
    let (version, _) = watch::channel(0);
    Self {
      id,
      data: None,
      error: None,
      last_success_at: None,
      invalidation: 0,
      refreshed: 0,
      hydrated: false,
      in_flight: None,
      version,
    }
  }

  fn is_invalidated(&self) -> bool {
    self.invalidation > self.refreshed
  }

  fn is_fresh(&self, now: DateTime<Utc>, stale_time: Duration) -> bool {
    if self.is_invalidated() || stale_time.is_zero() || self.data.is_none() {
      return false;
    }
    let Some(fetched_at) = self.last_success_at else {
      return false;
    };
    match chrono::Duration::from_std(stale_time) {
      Ok(stale_time) => now - fetched_at < stale_time,
      // Too large to represent: never goes stale
      Err(_) => true,
    }
  }

  /// Wake observers.
  fn touch(&self) {
    self.version.send_modify(|v| *v = v.wrapping_add(1));
  }

  fn result<T: Cacheable>(&self, key: &QueryKey) -> QueryResult<T> {
    let mut error = self.error.clone();
    let data = match &self.data {
      Some(payload) => match Arc::clone(payload).downcast::<T>() {
        Ok(data) => Some(data),
        Err(_) => {
          error = Some(QueryError::TypeMismatch {
            key: key.to_string(),
          });
          None
        }
      },
      None => None,
    };

    let is_fetching = self.in_flight.is_some();
    QueryResult {
      is_loading: is_fetching && data.is_none(),
      updated_at: data.as_ref().and(self.last_success_at),
      data,
      error,
      is_fetching,
      is_placeholder_data: false,
    }
  }

  fn info(&self, key: &QueryKey) -> EntryInfo {
    EntryInfo {
      key: key.clone(),
      last_success_at: self.last_success_at,
      has_data: self.data.is_some(),
      has_error: self.error.is_some(),
      is_fetching: self.in_flight.is_some(),
      observers: self.version.receiver_count(),
    }
  }
}

/// Read-only view of an entry, handed to eviction policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
  pub key: QueryKey,
  pub last_success_at: Option<DateTime<Utc>>,
  pub has_data: bool,
  pub has_error: bool,
  pub is_fetching: bool,
  /// Number of observers subscribed to the entry
  pub observers: usize,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Entries currently held
  pub entries: usize,
  /// Entries with a fetch in flight
  pub in_flight: usize,
  /// Fetcher invocations
  pub fetches_started: u64,
  /// Queries that joined an in-flight fetch instead of starting one
  pub deduplicated: u64,
  /// Queries answered from fresh data
  pub fresh_hits: u64,
  /// Queries skipped because they were disabled
  pub disabled: u64,
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<QueryKey, QueryEntry>,
  next_id: u64,
  stats: CacheStats,
}

impl CacheState {
  fn allocate_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  fn entry(&mut self, key: &QueryKey) -> &mut QueryEntry {
    let id = self.allocate_id();
    self
      .entries
      .entry(key.clone())
      .or_insert_with(|| QueryEntry::new(id))
  }
}

struct ClientInner {
  state: Mutex<CacheState>,
  clock: Arc<dyn Clock>,
  storage: Arc<dyn CacheStorage>,
  persist: bool,
}

impl ClientInner {
  /// The state is never left half-updated, so a poisoned lock is safe to reuse.
  fn state(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply a finished fetch to its entry. `generation` is the entry's
  /// invalidation count when the fetch started; invalidations made while it
  /// ran stay pending.
  fn complete(
    &self,
    key: &QueryKey,
    entry_id: u64,
    fetch_id: u64,
    generation: u64,
    outcome: &FetchOutcome,
    encoded: Option<Vec<u8>>,
  ) {
    let now = self.clock.now();
    {
      let mut state = self.state();
      let Some(entry) = state
        .entries
        .get_mut(key)
        .filter(|entry| entry.id == entry_id)
      else {
        debug!(%key, fetch_id, "entry removed while fetching, discarding result");
        return;
      };

      if entry.in_flight.as_ref().is_some_and(|f| f.id == fetch_id) {
        entry.in_flight = None;
      }

      match outcome {
        Ok(payload) => {
          entry.data = Some(Arc::clone(payload));
          entry.error = None;
          entry.last_success_at = Some(now);
          entry.refreshed = entry.refreshed.max(generation);
          debug!(%key, fetch_id, "fetch succeeded");
        }
        Err(error) => {
          // Previous data stays for display alongside the error
          entry.error = Some(error.clone());
          debug!(%key, fetch_id, %error, "fetch failed");
        }
      }
      entry.touch();
    }

    if let Some(bytes) = encoded {
      if let Err(e) = self.storage.save(key, &bytes, now) {
        warn!(%key, "Failed to persist query result: {}", e);
      }
    }
  }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
  clock: Option<Arc<dyn Clock>>,
  storage: Option<Arc<dyn CacheStorage>>,
}

impl QueryClientBuilder {
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  /// Persist successful payloads and hydrate empty entries from `storage`.
  pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn build(self) -> QueryClient {
    let persist = self.storage.is_some();
    QueryClient {
      inner: Arc::new(ClientInner {
        state: Mutex::new(CacheState::default()),
        clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        storage: self.storage.unwrap_or_else(|| Arc::new(NoopStorage)),
        persist,
      }),
    }
  }
}

/// Shared query cache. Cloning is cheap and every clone sees the same entries.
///
/// Create one at start-up and pass clones to consumers. Entries live until
/// [`reset`](Self::reset), [`remove_queries`](Self::remove_queries) or an
/// [`evict`](Self::evict) policy drops them.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryClient {
  /// In-memory client on the system clock.
  pub fn new() -> Self {
    Self::builder().build()
  }

  pub fn builder() -> QueryClientBuilder {
    QueryClientBuilder::default()
  }

  /// Run a query.
  ///
  /// 1. Disabled: idle state, no fetch
  /// 2. Entry fresh within `stale_time`: cached data, no fetch
  /// 3. Fetch already in flight for `key`: wait for that one
  /// 4. Otherwise: start a fetch and wait for it
  ///
  /// Failures are reported through [`QueryResult::error`]; this never panics
  /// or returns early because of the fetcher.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions,
  ) -> QueryResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    let begin = self.start(key, fetcher, &options, false);
    self.resolve(key, begin).await
  }

  /// Start a fetch regardless of staleness or any fetch already in flight.
  pub async fn refetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> QueryResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    let begin = self.start(key, fetcher, &QueryOptions::default(), true);
    self.resolve(key, begin).await
  }

  /// Current state of `key` without fetching.
  pub fn snapshot<T: Cacheable>(&self, key: &QueryKey) -> QueryResult<T> {
    let state = self.inner.state();
    match state.entries.get(key) {
      Some(entry) => entry.result(key),
      None => QueryResult::idle(),
    }
  }

  /// Cached data for `key`, fresh or not.
  pub fn get_query_data<T: Cacheable>(&self, key: &QueryKey) -> Option<Arc<T>> {
    self.snapshot::<T>(key).data
  }

  /// Mark every entry under `prefix` stale and drop persisted copies.
  /// Observers of those entries refetch when they next see an update.
  pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
    let count = {
      let mut state = self.inner.state();
      let mut count = 0;
      for (_, entry) in state
        .entries
        .iter_mut()
        .filter(|(key, _)| key.starts_with(prefix))
      {
        entry.invalidation += 1;
        entry.touch();
        count += 1;
      }
      count
    };

    self.forget_persisted(prefix);
    debug!(%prefix, count, "invalidated queries");
    count
  }

  /// Drop entries under `prefix`, skipping any with a fetch in flight.
  pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
    let removed = self.remove_where(|info| info.key.starts_with(prefix));
    self.forget_persisted(prefix);
    removed
  }

  /// Drop every entry the eviction `policy` selects. Entries with a fetch in
  /// flight are never offered to the policy.
  pub fn evict(&self, policy: impl Fn(&EntryInfo) -> bool) -> usize {
    let removed = self.remove_where(policy);
    debug!(removed, "evicted queries");
    removed
  }

  /// Drop all entries. Fetches still running are discarded when they finish.
  /// Persisted data is left alone.
  pub fn reset(&self) {
    let mut state = self.inner.state();
    let dropped = state.entries.len();
    state.entries.clear();
    debug!(dropped, "query cache reset");
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.inner.state();
    CacheStats {
      entries: state.entries.len(),
      in_flight: state
        .entries
        .values()
        .filter(|entry| entry.in_flight.is_some())
        .count(),
      ..state.stats
    }
  }

  /// Steps 1-4 of a query, without waiting. The in-flight marker is set
  /// before the lock is released, so concurrent callers for one key always
  /// see each other.
  pub(crate) fn start<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: &QueryOptions,
    force: bool,
  ) -> Begin
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    if !options.enabled {
      self.inner.state().stats.disabled += 1;
      debug!(%key, "query disabled");
      return Begin::Idle;
    }

    self.hydrate::<T>(key);

    let now = self.inner.clock.now();
    let mut guard = self.inner.state();
    let state = &mut *guard;
    let fetch_id = state.allocate_id();
    let entry = state.entry(key);

    if !force && entry.is_fresh(now, options.stale_time) {
      state.stats.fresh_hits += 1;
      debug!(%key, "serving fresh data");
      return Begin::Ready;
    }

    if !force {
      if let Some(in_flight) = &entry.in_flight {
        let (joined, fetch) = (in_flight.id, in_flight.fetch.clone());
        state.stats.deduplicated += 1;
        debug!(%key, fetch_id = joined, "joining fetch in flight");
        return Begin::Pending(fetch);
      }
    }

    let fetch = self.spawn_fetch(key.clone(), entry.id, fetch_id, entry.invalidation, fetcher);
    entry.in_flight = Some(InFlight {
      id: fetch_id,
      fetch: fetch.clone(),
    });
    entry.touch();
    state.stats.fetches_started += 1;
    debug!(%key, fetch_id, forced = force, "fetch started");
    Begin::Pending(fetch)
  }

  /// Turn a [`Begin`] into the caller's result.
  pub(crate) async fn resolve<T: Cacheable>(&self, key: &QueryKey, begin: Begin) -> QueryResult<T> {
    let fetch = match begin {
      Begin::Idle => return QueryResult::idle(),
      Begin::Ready => return self.snapshot(key),
      Begin::Pending(fetch) => fetch,
    };

    let outcome = fetch.await;
    // The entry may be fetching again already; report the fetch we waited on.
    let mut result = self.snapshot::<T>(key);
    result.is_loading = false;
    match outcome {
      Ok(payload) => match payload.downcast::<T>() {
        Ok(data) => {
          result.data = Some(data);
          result.error = None;
        }
        Err(_) => {
          result.data = None;
          result.error = Some(QueryError::TypeMismatch {
            key: key.to_string(),
          });
        }
      },
      Err(error) => result.error = Some(error),
    }
    result
  }

  pub(crate) fn subscribe(&self, key: &QueryKey) -> watch::Receiver<u64> {
    self.inner.state().entry(key).version.subscribe()
  }

  /// Invalidation count of `key` when it is invalidated and idle, so an
  /// observer can refetch once per invalidation.
  pub(crate) fn pending_invalidation(&self, key: &QueryKey) -> Option<u64> {
    self
      .inner
      .state()
      .entries
      .get(key)
      .filter(|entry| entry.is_invalidated() && entry.in_flight.is_none())
      .map(|entry| entry.invalidation)
  }

  fn spawn_fetch<T, F, Fut>(
    &self,
    key: QueryKey,
    entry_id: u64,
    fetch_id: u64,
    generation: u64,
    fetcher: F,
  ) -> SharedFetch
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    let task = tokio::spawn(async move {
      let result = AssertUnwindSafe(async move { fetcher().await })
        .catch_unwind()
        .await;

      let (outcome, encoded) = match result {
        Ok(FetchResult::Success(data)) => {
          let encoded = if inner.persist {
            serde_json::to_vec(&data)
              .map_err(|e| warn!(%key, "Failed to encode query result: {}", e))
              .ok()
          } else {
            None
          };
          (Ok(Arc::new(data) as Payload), encoded)
        }
        Ok(FetchResult::Failure(message)) => (Err(QueryError::Fetch(message)), None),
        Err(_) => {
          warn!(%key, fetch_id, "fetcher panicked");
          (Err(QueryError::Panicked), None)
        }
      };

      inner.complete(&key, entry_id, fetch_id, generation, &outcome, encoded);
      outcome
    });

    async move {
      task
        .await
        .unwrap_or_else(|e| Err(QueryError::Aborted(e.to_string())))
    }
    .boxed()
    .shared()
  }

  /// Fill an empty entry from persistent storage, once per entry.
  fn hydrate<T: Cacheable>(&self, key: &QueryKey) {
    if !self.inner.persist {
      return;
    }

    let entry_id = {
      let mut state = self.inner.state();
      let entry = state.entry(key);
      if entry.hydrated || entry.data.is_some() || entry.in_flight.is_some() {
        return;
      }
      entry.hydrated = true;
      entry.id
    };

    let stored = match self.inner.storage.load(key) {
      Ok(Some(stored)) => stored,
      Ok(None) => return,
      Err(e) => {
        warn!(%key, "Failed to read persisted query: {}", e);
        return;
      }
    };

    let data: T = match serde_json::from_slice(&stored.data) {
      Ok(data) => data,
      Err(e) => {
        warn!(%key, "Ignoring persisted query that no longer decodes: {}", e);
        return;
      }
    };

    let mut state = self.inner.state();
    if let Some(entry) = state
      .entries
      .get_mut(key)
      .filter(|entry| entry.id == entry_id && entry.data.is_none())
    {
      entry.data = Some(Arc::new(data));
      entry.last_success_at = Some(stored.cached_at);
      entry.touch();
      debug!(%key, cached_at = %stored.cached_at, "hydrated from storage");
    }
  }

  fn remove_where(&self, policy: impl Fn(&EntryInfo) -> bool) -> usize {
    let mut state = self.inner.state();
    let before = state.entries.len();
    state
      .entries
      .retain(|key, entry| entry.in_flight.is_some() || !policy(&entry.info(key)));
    before - state.entries.len()
  }

  fn forget_persisted(&self, prefix: &QueryKey) {
    if !self.inner.persist {
      return;
    }
    match self.inner.storage.remove_prefix(prefix) {
      Ok(removed) => debug!(%prefix, removed, "removed persisted queries"),
      Err(e) => warn!(%prefix, "Failed to remove persisted queries: {}", e),
    }
  }
}

impl fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("stats", &self.stats())
      .field("persist", &self.inner.persist)
      .finish_non_exhaustive()
  }
}
