//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::query::QueryKey;

/// A persisted query payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
  /// JSON-encoded payload
  pub data: Vec<u8>,
  /// When the payload was fetched
  pub cached_at: DateTime<Utc>,
}

/// Trait for persistent cache backends.
///
/// The query client calls these from inside its fetch pipeline and only logs
/// failures, so implementations should not retry or block for long.
pub trait CacheStorage: Send + Sync {
  /// Get the stored payload for a key.
  fn load(&self, key: &QueryKey) -> Result<Option<StoredEntry>>;

  /// Store a payload, replacing any previous one for the key.
  fn save(&self, key: &QueryKey, data: &[u8], cached_at: DateTime<Utc>) -> Result<()>;

  /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
  fn remove_prefix(&self, prefix: &QueryKey) -> Result<usize>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;

  /// Number of stored entries.
  fn len(&self) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when persistence is disabled - all operations are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _key: &QueryKey) -> Result<Option<StoredEntry>> {
    Ok(None) // Always miss
  }

  fn save(&self, _key: &QueryKey, _data: &[u8], _cached_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove_prefix(&self, _prefix: &QueryKey) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as the value.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("prq").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per query key (stores serialized JSON)
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn load(&self, key: &QueryKey) -> Result<Option<StoredEntry>> {
    let conn = self.conn()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM query_cache WHERE query_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached query {}: {}", key, e))?;

    match row {
      Some((data, cached_at_str)) => Ok(Some(StoredEntry {
        data,
        cached_at: parse_datetime(&cached_at_str)?,
      })),
      None => Ok(None),
    }
  }

  fn save(&self, key: &QueryKey, data: &[u8], cached_at: DateTime<Utc>) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_cache (query_hash, query_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![
          key.cache_hash(),
          key.to_json(),
          data,
          format_datetime(cached_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store cached query {}: {}", key, e))?;

    Ok(())
  }

  fn remove_prefix(&self, prefix: &QueryKey) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Prefix matching is done on parsed keys: a textual LIKE would let
    // ["project",4] match ["project",42].
    let matching: Vec<String> = {
      let mut stmt = tx
        .prepare("SELECT query_hash, query_key FROM query_cache")
        .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

      let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| eyre!("Failed to query keys: {}", e))?;

      let hashes: Vec<String> = rows
        .filter_map(|r| r.ok())
        .filter(|(_, key_json)| {
          serde_json::from_str::<QueryKey>(key_json)
            .map(|key| key.starts_with(prefix))
            .unwrap_or(false)
        })
        .map(|(hash, _)| hash)
        .collect();
      hashes
    };

    for hash in &matching {
      tx.execute("DELETE FROM query_cache WHERE query_hash = ?", params![hash])
        .map_err(|e| eyre!("Failed to delete cached query: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(matching.len())
  }

  fn clear(&self) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM query_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row("SELECT COUNT(*) FROM query_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cached queries: {}", e))?;
    Ok(usize::try_from(count).unwrap_or(0))
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a datetime string written by [`format_datetime`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
