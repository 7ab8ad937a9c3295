//! Composite query keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
  Bool(bool),
  Int(i64),
  Str(String),
  /// Named parameters, e.g. `{state, page, per_page}` for a list query.
  /// Field order never matters since the map is sorted.
  Object(BTreeMap<String, KeySegment>),
}

impl From<&str> for KeySegment {
  fn from(value: &str) -> Self {
    Self::Str(value.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(value: String) -> Self {
    Self::Str(value)
  }
}

impl From<i64> for KeySegment {
  fn from(value: i64) -> Self {
    Self::Int(value)
  }
}

impl From<i32> for KeySegment {
  fn from(value: i32) -> Self {
    Self::Int(i64::from(value))
  }
}

impl From<u32> for KeySegment {
  fn from(value: u32) -> Self {
    Self::Int(i64::from(value))
  }
}

impl From<bool> for KeySegment {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

/// Identity of one cacheable query: an ordered tuple of segments.
///
/// Two keys name the same query iff every segment compares equal by value,
/// so a key rebuilt from the same components on every call is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn from_segments(segments: Vec<KeySegment>) -> Self {
    Self(segments)
  }

  /// Append a segment.
  pub fn push(mut self, segment: impl Into<KeySegment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// Append a parameter object built from `(name, value)` pairs.
  pub fn object<I, K, V>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<KeySegment>,
  {
    let map = fields
      .into_iter()
      .map(|(k, v)| (k.into(), v.into()))
      .collect();
    self.0.push(KeySegment::Object(map));
    self
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True if `prefix` matches the leading segments of this key.
  /// The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// JSON array form, e.g. `["project",42,"pr",7,"details"]`.
  pub fn to_json(&self) -> String {
    // Segments are strings, integers, booleans and string-keyed maps, none of
    // which can fail to serialize.
    serde_json::to_string(&self.0).unwrap_or_default()
  }

  /// Stable, fixed-length identifier used by persistent storage.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_json().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_json())
  }
}

impl<S: Into<KeySegment>> FromIterator<S> for QueryKey {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}

/// Build a [`QueryKey`] from a list of segments.
///
/// ```
/// let key = prq::query_key!["project", 42, "pr", 7, "details"];
/// assert_eq!(key.to_json(), r#"["project",42,"pr",7,"details"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:expr),* $(,)?) => {
    $crate::query::QueryKey::from_segments(vec![$($crate::query::KeySegment::from($segment)),*])
  };
}
