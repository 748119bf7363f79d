//! Durable outbox of mutations waiting for connectivity.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::LocalStore;

/// Mutation types that can be deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
  CreateProduct,
  UpdateProduct,
  DeleteProduct,
  UpdateOrderStatus,
  UpdateStore,
  SendMessage,
}

impl ActionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::CreateProduct => "create_product",
      Self::UpdateProduct => "update_product",
      Self::DeleteProduct => "delete_product",
      Self::UpdateOrderStatus => "update_order_status",
      Self::UpdateStore => "update_store",
      Self::SendMessage => "send_message",
    }
  }
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "create_product" => Ok(Self::CreateProduct),
      "update_product" => Ok(Self::UpdateProduct),
      "delete_product" => Ok(Self::DeleteProduct),
      "update_order_status" => Ok(Self::UpdateOrderStatus),
      "update_store" => Ok(Self::UpdateStore),
      "send_message" => Ok(Self::SendMessage),
      other => Err(eyre!("Unknown action type '{}'", other)),
    }
  }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
  /// Monotonic, never reused
  pub id: i64,
  pub action: ActionKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

impl LocalStore {
  /// Append an action to the outbox and return its id.
  pub async fn enqueue_pending_action(&self, action: ActionKind, payload: Value) -> Result<i64> {
    let payload = serde_json::to_string(&payload)
      .map_err(|e| eyre!("Failed to serialize {} payload: {}", action, e))?;

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT INTO pending_sync (action, payload, enqueued_at) VALUES (?, ?, ?)",
            params![action.as_str(), payload, Utc::now().to_rfc3339()],
          )
          .map_err(|e| eyre!("Failed to enqueue {}: {}", action, e))?;
        Ok(conn.last_insert_rowid())
      })
      .await
  }

  /// Every queued action, oldest first.
  pub async fn list_pending_actions(&self) -> Result<Vec<PendingAction>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT id, action, payload, enqueued_at FROM pending_sync ORDER BY id")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, i64>(0)?,
              row.get::<_, String>(1)?,
              row.get::<_, String>(2)?,
              row.get::<_, String>(3)?,
            ))
          })
          .map_err(|e| eyre!("Failed to query outbox: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

        rows
          .into_iter()
          .map(|(id, action, payload, enqueued_at)| {
            Ok(PendingAction {
              id,
              action: action.parse()?,
              payload: serde_json::from_str(&payload)
                .map_err(|e| eyre!("Failed to deserialize payload of action {}: {}", id, e))?,
              enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?,
            })
          })
          .collect()
      })
      .await
  }

  /// Remove an acknowledged action. Returns false if it was already gone.
  pub async fn remove_pending_action(&self, id: i64) -> Result<bool> {
    self
      .with_conn(move |conn| {
        let removed = conn
          .execute("DELETE FROM pending_sync WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to remove pending action {}: {}", id, e))?;
        Ok(removed > 0)
      })
      .await
  }

  pub async fn pending_action_count(&self) -> Result<usize> {
    self
      .with_conn(|conn| {
        let count: i64 = conn
          .query_row("SELECT COUNT(*) FROM pending_sync", [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to count pending actions: {}", e))?;
        Ok(count as usize)
      })
      .await
  }
}
