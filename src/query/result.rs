//! Fetch outcomes and the state records handed to consumers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one invocation of a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult<T> {
  Success(T),
  /// Human-readable failure message
  Failure(String),
}

impl<T> FetchResult<T> {
  pub fn failure(message: impl Into<String>) -> Self {
    Self::Failure(message.into())
  }

  pub fn is_success(&self) -> bool {
    matches!(self, Self::Success(_))
  }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for FetchResult<T> {
  fn from(result: Result<T, E>) -> Self {
    match result {
      Ok(data) => Self::Success(data),
      Err(e) => Self::Failure(e.to_string()),
    }
  }
}

/// Wire shape returned by the service layer: `{ success, data?, error? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl<T> ServiceResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn err(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(message.into()),
    }
  }

  /// Convert into a [`FetchResult`].
  ///
  /// `success: false` is a failure even when `data` is present, and a
  /// successful response without data is a failure as well.
  pub fn into_fetch_result(self) -> FetchResult<T> {
    match (self.success, self.data) {
      (true, Some(data)) => FetchResult::Success(data),
      (true, None) => FetchResult::failure("response did not include data"),
      (false, _) => FetchResult::Failure(
        self
          .error
          .unwrap_or_else(|| "request failed".to_string()),
      ),
    }
  }
}

impl<T> From<ServiceResponse<T>> for FetchResult<T> {
  fn from(response: ServiceResponse<T>) -> Self {
    response.into_fetch_result()
  }
}

/// Errors surfaced through [`QueryResult::error`]. The cache never returns
/// these through `Result`; they are part of the query state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
  /// The fetcher reported a failure
  #[error("{0}")]
  Fetch(String),
  /// The fetcher panicked
  #[error("fetcher panicked")]
  Panicked,
  /// The fetch task was cancelled before it finished (runtime shutdown)
  #[error("fetch aborted: {0}")]
  Aborted(String),
  /// The entry holds data of a different type than was requested
  #[error("cached data for {key} has a different type than requested")]
  TypeMismatch { key: String },
}

impl QueryError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}

/// Coarse status derived from a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Disabled, or nothing requested yet
  Idle,
  /// First fetch in flight, no data yet
  Loading,
  /// Data available
  Success,
  /// Last fetch failed
  Error,
}

/// Snapshot of one query as seen by a consumer.
#[derive(Debug)]
pub struct QueryResult<T> {
  /// Last successful payload, retained across later failures
  pub data: Option<Arc<T>>,
  /// Error of the most recent completed fetch, if it failed
  pub error: Option<QueryError>,
  /// A fetch is in flight and there is no data to show yet
  pub is_loading: bool,
  /// A fetch is in flight, with or without data
  pub is_fetching: bool,
  /// `data` belongs to the previous key of an observer
  pub is_placeholder_data: bool,
  /// When `data` was fetched
  pub updated_at: Option<DateTime<Utc>>,
}

// Manual impl: `T` itself need not be Clone since data is behind an Arc.
impl<T> Clone for QueryResult<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      error: self.error.clone(),
      is_loading: self.is_loading,
      is_fetching: self.is_fetching,
      is_placeholder_data: self.is_placeholder_data,
      updated_at: self.updated_at,
    }
  }
}

impl<T> Default for QueryResult<T> {
  fn default() -> Self {
    Self::idle()
  }
}

impl<T> QueryResult<T> {
  /// State of a disabled query.
  pub fn idle() -> Self {
    Self {
      data: None,
      error: None,
      is_loading: false,
      is_fetching: false,
      is_placeholder_data: false,
      updated_at: None,
    }
  }

  pub fn status(&self) -> QueryStatus {
    if self.error.is_some() {
      QueryStatus::Error
    } else if self.data.is_some() {
      QueryStatus::Success
    } else if self.is_loading {
      QueryStatus::Loading
    } else {
      QueryStatus::Idle
    }
  }

  pub fn is_idle(&self) -> bool {
    self.status() == QueryStatus::Idle
  }

  pub fn is_success(&self) -> bool {
    self.status() == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_deref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  /// Project the payload, keeping the rest of the state.
  pub fn map<U>(&self, f: impl FnOnce(&T) -> U) -> QueryResult<U> {
    QueryResult {
      data: self.data.as_deref().map(|d| Arc::new(f(d))),
      error: self.error.clone(),
      is_loading: self.is_loading,
      is_fetching: self.is_fetching,
      is_placeholder_data: self.is_placeholder_data,
      updated_at: self.updated_at,
    }
  }
}
