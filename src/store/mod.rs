//! Persistent local store for mirrored entities and the pending-action outbox.
//!
//! The store is an explicit handle: open it, pass clones to whoever needs
//! storage, close it when done. The schema is created lazily by the first
//! operation and creation is idempotent.

mod outbox;
mod records;

pub use outbox::{ActionKind, PendingAction};
pub use records::{Collection, Order, Product, Record, StoreProfile};

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct Inner {
  /// None once the store has been closed
  conn: Option<Connection>,
  initialized: bool,
}

/// Handle to the on-device store. Clones share one connection.
#[derive(Clone)]
pub struct LocalStore {
  inner: Arc<Mutex<Inner>>,
}

/// Schema for mirrored entities and the outbox.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    key TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    index_value TEXT,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_products_store ON products(owner_id);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(owner_id, index_value);

CREATE TABLE IF NOT EXISTS orders (
    key TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    index_value TEXT,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_store ON orders(owner_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(owner_id, index_value);

CREATE TABLE IF NOT EXISTS store_profile (
    key TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    index_value TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_sync (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);
"#;

impl LocalStore {
  /// Open (or create) the store database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open local store at {}: {}", path.display(), e))?;

    Ok(Self::from_connection(conn))
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory local store: {}", e))?;
    Ok(Self::from_connection(conn))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        conn: Some(conn),
        initialized: false,
      })),
    }
  }

  /// Close the underlying connection. Later operations fail.
  pub async fn close(&self) -> Result<()> {
    let inner = Arc::clone(&self.inner);
    tokio::task::spawn_blocking(move || {
      let mut guard = inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      match guard.conn.take() {
        Some(conn) => conn
          .close()
          .map_err(|(_, e)| eyre!("Failed to close local store: {}", e)),
        None => Ok(()),
      }
    })
    .await
    .map_err(|e| eyre!("Local store task failed: {}", e))?
  }

  /// Run `op` against the connection on the blocking pool, creating the
  /// schema first if this is the first operation.
  pub(crate) async fn with_conn<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    tokio::task::spawn_blocking(move || {
      let mut guard = inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let inner = &mut *guard;
      let conn = inner
        .conn
        .as_ref()
        .ok_or_else(|| eyre!("Local store is closed"))?;

      if !inner.initialized {
        conn
          .execute_batch(STORE_SCHEMA)
          .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
        inner.initialized = true;
        debug!("Local store schema ready");
      }

      op(conn)
    })
    .await
    .map_err(|e| eyre!("Local store task failed: {}", e))?
  }

  /// Upsert records by primary key. Each record is written on its own;
  /// a failure leaves earlier writes in place.
  pub async fn save_entities<R: Record>(&self, records: &[R]) -> Result<()> {
    let table = R::COLLECTION.table();
    let rows = records
      .iter()
      .map(|record| {
        let data = serde_json::to_string(record)
          .map_err(|e| eyre!("Failed to serialize {} record: {}", table, e))?;
        Ok((
          record.primary_key().to_string(),
          record.owner_id().to_string(),
          record.index_value().map(String::from),
          data,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .with_conn(move |conn| {
        let sql = format!(
          "INSERT OR REPLACE INTO {} (key, owner_id, index_value, data) VALUES (?, ?, ?, ?)",
          table
        );
        for (key, owner_id, index_value, data) in rows {
          conn
            .execute(&sql, params![key, owner_id, index_value, data])
            .map_err(|e| eyre!("Failed to store {} record {}: {}", table, key, e))?;
        }
        Ok(())
      })
      .await
  }

  /// Snapshot of every record owned by `owner_id`.
  pub async fn get_entities_by_owner<R: Record>(&self, owner_id: &str) -> Result<Vec<R>> {
    let owner_id = owner_id.to_string();
    self
      .with_conn(move |conn| {
        let sql = format!("SELECT data FROM {} WHERE owner_id = ?", R::COLLECTION.table());
        query_records(conn, &sql, params![owner_id])
      })
      .await
  }

  /// Records owned by `owner_id` whose secondary index equals `index_value`
  /// (product category, order status).
  pub async fn get_entities_by_index<R: Record>(
    &self,
    owner_id: &str,
    index_value: &str,
  ) -> Result<Vec<R>> {
    let owner_id = owner_id.to_string();
    let index_value = index_value.to_string();
    self
      .with_conn(move |conn| {
        let sql = format!(
          "SELECT data FROM {} WHERE owner_id = ? AND index_value = ?",
          R::COLLECTION.table()
        );
        query_records(conn, &sql, params![owner_id, index_value])
      })
      .await
  }

  pub async fn save_owner_profile(&self, profile: &StoreProfile) -> Result<()> {
    self.save_entities(std::slice::from_ref(profile)).await
  }

  pub async fn get_owner_profile(&self, store_id: &str) -> Result<Option<StoreProfile>> {
    let store_id = store_id.to_string();
    self
      .with_conn(move |conn| {
        let data: Option<String> = conn
          .query_row(
            "SELECT data FROM store_profile WHERE key = ?",
            params![store_id],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to query store profile: {}", e))?;

        data
          .map(|data| {
            serde_json::from_str(&data)
              .map_err(|e| eyre!("Failed to deserialize store profile: {}", e))
          })
          .transpose()
      })
      .await
  }

  /// Wipe every collection, outbox included. Used for full resets only.
  pub async fn clear_all(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .execute_batch(
            "DELETE FROM products;
             DELETE FROM orders;
             DELETE FROM store_profile;
             DELETE FROM pending_sync;",
          )
          .map_err(|e| eyre!("Failed to clear local store: {}", e))
      })
      .await
  }
}

fn query_records<R: Record>(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<R>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows = stmt
    .query_map(params, |row| row.get::<_, String>(0))
    .map_err(|e| eyre!("Failed to query records: {}", e))?
    .collect::<rusqlite::Result<Vec<String>>>()
    .map_err(|e| eyre!("Failed to read record: {}", e))?;

  rows
    .iter()
    .map(|data| {
      serde_json::from_str(data).map_err(|e| eyre!("Failed to deserialize record: {}", e))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Map;

  fn product(id: &str, store: &str, category: Option<&str>, price: f64) -> Product {
    Product {
      product_id: id.to_string(),
      store_id: store.to_string(),
      name: format!("Product {id}"),
      description: None,
      price,
      stock: 5,
      images: Vec::new(),
      category: category.map(String::from),
      is_active: true,
      extra: Map::new(),
    }
  }

  fn order(id: &str, store: &str, status: &str) -> Order {
    Order {
      order_id: id.to_string(),
      store_id: store.to_string(),
      customer_name: "Asha".to_string(),
      customer_phone: "9999999999".to_string(),
      customer_email: None,
      items: Vec::new(),
      total_amount: 120.0,
      status: status.to_string(),
      payment_status: None,
      extra: Map::new(),
    }
  }

  fn profile(store: &str, name: &str) -> StoreProfile {
    StoreProfile {
      store_id: store.to_string(),
      user_id: "user_1".to_string(),
      store_name: name.to_string(),
      subdomain: "corner".to_string(),
      description: None,
      logo_url: None,
      language: Some("en".to_string()),
      extra: Map::new(),
    }
  }

  #[tokio::test]
  async fn test_save_and_get_by_owner() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .save_entities(&[
        product("p1", "s1", Some("tea"), 10.0),
        product("p2", "s1", None, 20.0),
        product("p3", "s2", Some("tea"), 30.0),
      ])
      .await
      .unwrap();

    let mut products: Vec<Product> = store.get_entities_by_owner("s1").await.unwrap();
    products.sort_by(|a, b| a.product_id.cmp(&b.product_id));

    assert_eq!(products.len(), 2);
    assert_eq!(products[0].product_id, "p1");
    assert_eq!(products[1].product_id, "p2");
  }

  #[tokio::test]
  async fn test_save_overwrites_same_key() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .save_entities(&[product("p1", "s1", None, 10.0)])
      .await
      .unwrap();
    store
      .save_entities(&[product("p1", "s1", None, 99.0)])
      .await
      .unwrap();

    let products: Vec<Product> = store.get_entities_by_owner("s1").await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].price, 99.0);
  }

  #[tokio::test]
  async fn test_secondary_indexes() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .save_entities(&[
        product("p1", "s1", Some("tea"), 10.0),
        product("p2", "s1", Some("snacks"), 20.0),
      ])
      .await
      .unwrap();
    store
      .save_entities(&[
        order("o1", "s1", "pending"),
        order("o2", "s1", "shipped"),
        order("o3", "s2", "pending"),
      ])
      .await
      .unwrap();

    let tea: Vec<Product> = store.get_entities_by_index("s1", "tea").await.unwrap();
    assert_eq!(tea.len(), 1);
    assert_eq!(tea[0].product_id, "p1");

    let pending: Vec<Order> = store.get_entities_by_index("s1", "pending").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].order_id, "o1");
  }

  #[tokio::test]
  async fn test_owner_profile_roundtrip() {
    let store = LocalStore::open_in_memory().unwrap();
    assert!(store.get_owner_profile("s1").await.unwrap().is_none());

    store.save_owner_profile(&profile("s1", "Corner Shop")).await.unwrap();
    store.save_owner_profile(&profile("s1", "Corner Store")).await.unwrap();

    let loaded = store.get_owner_profile("s1").await.unwrap().unwrap();
    assert_eq!(loaded.store_name, "Corner Store");
  }

  #[tokio::test]
  async fn test_clear_all_wipes_everything() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .save_entities(&[product("p1", "s1", None, 10.0)])
      .await
      .unwrap();
    store.save_owner_profile(&profile("s1", "Corner")).await.unwrap();
    store
      .enqueue_pending_action(ActionKind::DeleteProduct, serde_json::json!({"product_id": "p1"}))
      .await
      .unwrap();

    store.clear_all().await.unwrap();

    let products: Vec<Product> = store.get_entities_by_owner("s1").await.unwrap();
    assert!(products.is_empty());
    assert!(store.get_owner_profile("s1").await.unwrap().is_none());
    assert!(store.list_pending_actions().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_first_use_initializes_once() {
    let store = LocalStore::open_in_memory().unwrap();

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
          store
            .save_entities(&[product(&format!("p{i}"), "s1", None, 1.0)])
            .await
        })
      })
      .collect();
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    let products: Vec<Product> = store.get_entities_by_owner("s1").await.unwrap();
    assert_eq!(products.len(), 8);
  }

  #[tokio::test]
  async fn test_closed_store_rejects_operations() {
    let store = LocalStore::open_in_memory().unwrap();
    store.close().await.unwrap();

    let result: Result<Vec<Product>> = store.get_entities_by_owner("s1").await;
    assert!(result.is_err());
    store.close().await.unwrap();
  }

  #[tokio::test]
  async fn test_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("local.db");

    let store = LocalStore::open(&path).unwrap();
    store
      .enqueue_pending_action(ActionKind::CreateProduct, serde_json::json!({"name": "Chai"}))
      .await
      .unwrap();
    store.close().await.unwrap();

    let reopened = LocalStore::open(&path).unwrap();
    let actions = reopened.list_pending_actions().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, ActionKind::CreateProduct);
  }
}
