//! Consumer-side binding of one query to the shared cache.
//!
//! A [`QueryObserver`] remembers the key a consumer is currently interested
//! in and re-evaluates when that key (or its options) changes. It never owns
//! data: every read goes through the [`QueryClient`].
//!
//! # Example
//!
//! ```ignore
//! let api = review_client.clone();
//! let mut details = QueryObserver::new(client.clone(), move |key| {
//!     let api = api.clone();
//!     async move { api.pr_details_for(&key).await.into_fetch_result() }
//! });
//!
//! // On every render
//! details.set_query(query_key!["project", 42, "pr", 7, "details"], options);
//!
//! // In the event loop tick
//! if details.poll() {
//!     // Entry changed, trigger re-render
//! }
//!
//! // In render
//! let state = details.state();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::Cacheable;

use super::client::{Begin, QueryClient};
use super::key::QueryKey;
use super::options::QueryOptions;
use super::result::{FetchResult, QueryResult};

/// A factory that creates the fetch for a key
type FetcherFn<T> = Arc<dyn Fn(QueryKey) -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

/// One consumer's view of a query.
pub struct QueryObserver<T> {
  client: QueryClient,
  fetcher: FetcherFn<T>,
  key: Option<QueryKey>,
  options: QueryOptions,
  updates: Option<watch::Receiver<u64>>,
  placeholder: Option<Arc<T>>,
  /// Last invalidation this observer refetched for.
  handled_invalidation: u64,
}

impl<T: Cacheable> QueryObserver<T> {
  /// Create an observer with no key yet.
  ///
  /// The fetcher receives the key it is fetching for and is called each
  /// time the cache decides a fetch is needed.
  pub fn new<F, Fut>(client: QueryClient, fetcher: F) -> Self
  where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    Self {
      client,
      fetcher: Arc::new(move |key| fetcher(key).boxed()),
      key: None,
      options: QueryOptions::default(),
      updates: None,
      placeholder: None,
      handled_invalidation: 0,
    }
  }

  /// Point the observer at `key`.
  ///
  /// Safe to call on every render: a value-equal key with the same options
  /// does nothing. Returns whether evaluation restarted.
  pub fn set_query(&mut self, key: QueryKey, options: QueryOptions) -> bool {
    if self.key.as_ref() == Some(&key) && self.options == options {
      return false;
    }

    if self.key.as_ref() != Some(&key) {
      self.placeholder = if options.keep_previous_data {
        self.state().data
      } else {
        None
      };
      if let Some(previous) = &self.key {
        debug!(from = %previous, to = %key, "query key changed");
      }
    }

    self.key = Some(key);
    self.options = options;
    self.evaluate();
    true
  }

  pub fn key(&self) -> Option<&QueryKey> {
    self.key.as_ref()
  }

  pub fn options(&self) -> &QueryOptions {
    &self.options
  }

  /// Current state for the current key. Idle when disabled or unset.
  pub fn state(&self) -> QueryResult<T> {
    let Some(key) = self.key.as_ref().filter(|_| self.options.enabled) else {
      return QueryResult::idle();
    };

    let mut result = self.client.snapshot::<T>(key);
    if result.data.is_none() {
      if let Some(previous) = &self.placeholder {
        result.data = Some(Arc::clone(previous));
        result.is_placeholder_data = true;
        result.is_loading = false;
      }
    }
    result
  }

  /// Check for entry updates without blocking.
  ///
  /// Returns `true` if the entry changed since the last call.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let Some(updates) = self.updates.as_mut() else {
      return false;
    };

    match updates.has_changed() {
      Ok(false) => false,
      Ok(true) => {
        let _ = updates.borrow_and_update();
        self.on_update();
        true
      }
      // Entry dropped by a reset or eviction
      Err(_) => {
        self.evaluate();
        true
      }
    }
  }

  /// Wait until the entry changes. Returns immediately with `false` when
  /// there is nothing to wait on (no key, or disabled).
  pub async fn changed(&mut self) -> bool {
    let Some(updates) = self.updates.as_mut() else {
      return false;
    };

    if updates.changed().await.is_ok() {
      self.on_update();
    } else {
      self.evaluate();
    }
    true
  }

  /// Force a fetch for the current key.
  ///
  /// The fetch starts immediately; the returned future only waits for it.
  /// Resolves to idle without fetching when disabled.
  pub fn refetch(&self) -> BoxFuture<'static, QueryResult<T>> {
    let Some(key) = self.key.clone().filter(|_| self.options.enabled) else {
      return future::ready(QueryResult::idle()).boxed();
    };

    let begin = self.start(&key, true);
    let client = self.client.clone();
    async move { client.resolve(&key, begin).await }.boxed()
  }

  fn evaluate(&mut self) {
    let Some(key) = self.key.clone() else {
      return;
    };
    if !self.options.enabled {
      self.updates = None;
      return;
    }

    self.updates = Some(self.client.subscribe(&key));
    self.handled_invalidation = self.client.pending_invalidation(&key).unwrap_or(0);
    self.start(&key, false);
  }

  fn on_update(&mut self) {
    let Some(key) = self.key.clone() else {
      return;
    };

    // One refetch per invalidation; a failed refetch waits for the next one
    let pending = self
      .client
      .pending_invalidation(&key)
      .filter(|generation| *generation > self.handled_invalidation);

    if let Some(generation) = pending {
      debug!(%key, generation, "refetching invalidated query");
      self.handled_invalidation = generation;
      self.start(&key, false);
    } else if self.placeholder.is_some() && self.client.get_query_data::<T>(&key).is_some() {
      self.placeholder = None;
    }
  }

  fn start(&self, key: &QueryKey, force: bool) -> Begin {
    let fetcher = Arc::clone(&self.fetcher);
    let fetch_key = key.clone();
    self
      .client
      .start(key, move || fetcher(fetch_key), &self.options, force)
  }
}

// QueryObserver is not Clone: each consumer tracks its own key.
// Clone the QueryClient instead and create another observer.

impl<T: fmt::Debug> fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("options", &self.options)
      .field("placeholder", &self.placeholder)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::QueryError;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::Notify;

  /// Wait until the observed entry has no fetch in flight.
  async fn settle<T: Cacheable>(observer: &mut QueryObserver<T>) -> QueryResult<T> {
    loop {
      let state = observer.state();
      if !state.is_fetching {
        return state;
      }
      tokio::time::timeout(Duration::from_secs(1), observer.changed())
        .await
        .expect("query did not settle");
    }
  }

  fn counting_observer(
    client: &QueryClient,
    calls: &Arc<AtomicUsize>,
  ) -> QueryObserver<String> {
    let calls = Arc::clone(calls);
    QueryObserver::new(client.clone(), move |key: QueryKey| {
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        FetchResult::Success(key.to_string())
      }
    })
  }

  #[tokio::test]
  async fn test_observer_success() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);

    assert!(observer.state().is_idle());

    observer.set_query(query_key!["projects"], QueryOptions::new());
    assert!(observer.state().is_loading);

    let state = settle(&mut observer).await;
    assert!(state.is_success());
    assert_eq!(state.data().map(String::as_str), Some(r#"["projects"]"#));
  }

  #[tokio::test]
  async fn test_observer_error() {
    let client = QueryClient::new();
    let mut observer: QueryObserver<i32> = QueryObserver::new(client, |_| async {
      FetchResult::failure("Something went wrong")
    });

    observer.set_query(query_key!["projects"], QueryOptions::new());
    let state = settle(&mut observer).await;

    assert!(state.is_error());
    assert_eq!(
      state.error,
      Some(QueryError::Fetch("Something went wrong".to_string()))
    );
    assert!(!state.is_loading);
  }

  #[tokio::test]
  async fn test_disabled_observer_stays_idle() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);

    observer.set_query(
      query_key!["project", 0, "pr", 7, "details"],
      QueryOptions::new().enabled(false),
    );

    assert!(observer.state().is_idle());
    assert!(!observer.poll());
    assert!(observer.refetch().await.is_idle());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_enabling_starts_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);
    let key = query_key!["project", 5, "branches"];

    observer.set_query(key.clone(), QueryOptions::new().enabled(false));
    assert!(observer.set_query(key, QueryOptions::new()));

    let state = settle(&mut observer).await;
    assert!(state.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_value_equal_key_is_noop() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);

    assert!(observer.set_query(query_key!["project", 42, "pr", 7], QueryOptions::new()));
    settle(&mut observer).await;

    // Rebuilt on every render, but equal by value
    for _ in 0..3 {
      assert!(!observer.set_query(query_key!["project", 42, "pr", 7], QueryOptions::new()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_key_change_discards_previous_result() {
    let client = QueryClient::new();
    let gate = Arc::new(Notify::new());
    let first = query_key!["project", 1, "pr", 1, "details"];
    let second = query_key!["project", 1, "pr", 2, "details"];

    let slow_key = first.clone();
    let waiter = gate.clone();
    let mut observer = QueryObserver::new(client.clone(), move |key: QueryKey| {
      let slow = key == slow_key;
      let waiter = waiter.clone();
      async move {
        if slow {
          waiter.notified().await;
          FetchResult::Success("first".to_string())
        } else {
          FetchResult::Success("second".to_string())
        }
      }
    });

    observer.set_query(first.clone(), QueryOptions::new());
    observer.set_query(second.clone(), QueryOptions::new());
    let state = settle(&mut observer).await;
    assert_eq!(state.data().map(String::as_str), Some("second"));

    // Let the first fetch finish and wait for it through the cache
    gate.notify_one();
    let late = client
      .fetch_query(
        &first,
        || async { FetchResult::Success("unused".to_string()) },
        QueryOptions::new(),
      )
      .await;
    assert_eq!(late.data().map(String::as_str), Some("first"));

    assert_eq!(observer.state().data().map(String::as_str), Some("second"));
    assert_eq!(
      client.get_query_data::<String>(&second).as_deref().map(String::as_str),
      Some("second")
    );
  }

  #[tokio::test]
  async fn test_keep_previous_data() {
    let client = QueryClient::new();
    let gate = Arc::new(Notify::new());
    let waiter = gate.clone();
    let mut observer = QueryObserver::new(client, move |key: QueryKey| {
      let waiter = waiter.clone();
      async move {
        if key.len() > 2 {
          waiter.notified().await;
        }
        FetchResult::Success(key.len())
      }
    });
    let options = QueryOptions::new().keep_previous_data(true);

    observer.set_query(query_key!["project", 1], options);
    assert_eq!(settle(&mut observer).await.data(), Some(&2));

    observer.set_query(query_key!["project", 1, "page"], options);
    let state = observer.state();
    assert_eq!(state.data(), Some(&2));
    assert!(state.is_placeholder_data);
    assert!(!state.is_loading);
    assert!(state.is_fetching);

    gate.notify_one();
    let state = settle(&mut observer).await;
    assert_eq!(state.data(), Some(&3));
    assert!(!state.is_placeholder_data);
  }

  #[tokio::test]
  async fn test_refetch_forces_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);
    let options = QueryOptions::new().stale_time(Duration::from_secs(300));

    observer.set_query(query_key!["projects"], options);
    settle(&mut observer).await;

    let result = observer.refetch().await;
    assert!(result.is_success());
    assert!(!result.is_loading);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_observers_share_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut a = counting_observer(&client, &calls);
    let mut b = counting_observer(&client, &calls);

    a.set_query(query_key!["project", 3], QueryOptions::new());
    b.set_query(query_key!["project", 3], QueryOptions::new());

    settle(&mut a).await;
    settle(&mut b).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.state().data(), b.state().data());
  }

  #[tokio::test]
  async fn test_observer_refetches_after_invalidation() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);
    let options = QueryOptions::new().stale_time(Duration::from_secs(300));

    observer.set_query(query_key!["project", 42, "pr", 7, "comments"], options);
    settle(&mut observer).await;
    observer.poll();

    client.invalidate_queries(&query_key!["project", 42]);
    assert!(observer.poll());
    let state = settle(&mut observer).await;

    assert!(state.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_refetch_after_invalidation_does_not_loop() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut observer: QueryObserver<i32> = QueryObserver::new(client.clone(), move |_| {
      let counter = Arc::clone(&counter);
      async move {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
          FetchResult::Success(1)
        } else {
          FetchResult::failure("down")
        }
      }
    });
    let options = QueryOptions::new().stale_time(Duration::from_secs(300));

    observer.set_query(query_key!["project", 42], options);
    settle(&mut observer).await;
    observer.poll();

    client.invalidate_queries(&query_key!["project", 42]);
    assert!(observer.changed().await);
    let state = settle(&mut observer).await;
    assert_eq!(state.data(), Some(&1));
    assert!(state.is_error());

    // The failure is an update too, but must not trigger another fetch
    for _ in 0..5 {
      let _ = tokio::time::timeout(Duration::from_millis(20), observer.changed()).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A new invalidation earns one more attempt
    client.invalidate_queries(&query_key!["project", 42]);
    assert!(observer.changed().await);
    settle(&mut observer).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_observer_recovers_after_reset() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut observer = counting_observer(&client, &calls);

    observer.set_query(query_key!["projects"], QueryOptions::new());
    settle(&mut observer).await;

    client.reset();
    assert!(observer.state().is_idle());

    assert!(observer.poll());
    let state = settle(&mut observer).await;
    assert!(state.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
