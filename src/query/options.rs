use std::time::Duration;

/// Per-query options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// Result of the enablement predicate. A disabled query never fetches.
  pub enabled: bool,
  /// How long a successful result stays fresh. Zero means always stale.
  pub stale_time: Duration,
  /// Observers keep showing the previous key's data while the new key loads.
  pub keep_previous_data: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: Duration::ZERO,
      keep_previous_data: false,
    }
  }
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn keep_previous_data(mut self, keep: bool) -> Self {
    self.keep_previous_data = keep;
    self
  }
}
