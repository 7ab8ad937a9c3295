//! Retry and timeout wrappers for fetchers.
//!
//! The cache itself never retries or times out; callers layer these around
//! the fetcher they hand to it.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::result::FetchResult;

/// How often to re-run a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Extra attempts after the first failure
  pub retries: u32,
  /// Pause between attempts
  pub delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 1,
      delay: Duration::from_millis(500),
    }
  }
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      retries: 0,
      delay: Duration::ZERO,
    }
  }
}

/// Run `attempt` until it succeeds or the policy is exhausted. The last
/// failure is returned as-is.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut attempt: F) -> FetchResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = FetchResult<T>>,
{
  let mut tries = 0;
  loop {
    match attempt().await {
      FetchResult::Failure(message) if tries < policy.retries => {
        tries += 1;
        debug!(attempt = tries, retries = policy.retries, %message, "retrying failed fetch");
        if !policy.delay.is_zero() {
          tokio::time::sleep(policy.delay).await;
        }
      }
      result => return result,
    }
  }
}

/// Fail the fetch if it takes longer than `limit`.
pub async fn with_timeout<T, Fut>(limit: Duration, fetch: Fut) -> FetchResult<T>
where
  Fut: Future<Output = FetchResult<T>>,
{
  match tokio::time::timeout(limit, fetch).await {
    Ok(result) => result,
    Err(_) => FetchResult::Failure(format!(
      "request timed out after {}ms",
      limit.as_millis()
    )),
  }
}
