//! Cache partition storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::http::{Request, Response};

/// A response previously stored for a request.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: Response,
  /// Partition the entry was found in
  pub partition: String,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache partition backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Store a successful response, replacing any prior entry for the request.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up a request in one partition.
  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across every partition, newest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Names of every existing partition, in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and its entries. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Number of entries stored in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the partition database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Partition storage that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache partitions.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_request ON entries(request_key);
"#;

fn ensure_partition(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;
  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn decode_entry(row: EntryRow) -> Result<CachedResponse> {
  let (partition, status, headers, body, stored_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    partition,
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_partition(&conn, name)
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    if !response.is_success() {
      return Err(eyre!(
        "Refusing to cache {} with status {}",
        request.describe(),
        response.status
      ));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize response headers: {}", e))?;

    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_partition(&tx, partition)?;
    tx.execute(
      "INSERT OR REPLACE INTO entries (partition, request_key, request, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        request.cache_key(),
        request.describe(),
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", request.describe(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT partition, status, headers, body, stored_at FROM entries
         WHERE partition = ? AND request_key = ?",
        params![partition, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.partition, e.status, e.headers, e.body, e.stored_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.request_key = ?
         ORDER BY p.rowid DESC
         LIMIT 1",
        params![request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
