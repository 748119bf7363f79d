//! Push messages and notification clicks, forwarded to the host.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

const ICON: &str = "/icon-192x192.png";
const BADGE: &str = "/icon-96x96.png";
const VIBRATE: [u32; 3] = [200, 100, 200];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Payload of an inbound push message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushMessage {
  pub title: String,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub data: Value,
}

/// What the host is asked to display.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub title: String,
  pub body: Option<String>,
  pub icon: &'static str,
  pub badge: &'static str,
  pub vibrate: [u32; 3],
  pub actions: Vec<NotificationAction>,
  pub data: Value,
}

impl From<PushMessage> for Notification {
  fn from(message: PushMessage) -> Self {
    Self {
      title: message.title,
      body: message.body,
      icon: ICON,
      badge: BADGE,
      vibrate: VIBRATE,
      actions: message.actions,
      data: message.data,
    }
  }
}

/// The host's notification and window primitives.
pub trait NotificationSurface: Send + Sync {
  fn show(&self, notification: Notification) -> Result<()>;

  fn open_url(&self, url: &str) -> Result<()>;
}

/// Surface that only logs; used when no desktop integration exists.
pub struct LogSurface;

impl NotificationSurface for LogSurface {
  fn show(&self, notification: Notification) -> Result<()> {
    info!(
      "Notification: {} - {}",
      notification.title,
      notification.body.as_deref().unwrap_or("")
    );
    Ok(())
  }

  fn open_url(&self, url: &str) -> Result<()> {
    info!("Open window: {}", url);
    Ok(())
  }
}

/// Show an inbound push message. Empty payloads are ignored.
pub fn handle_push(surface: &dyn NotificationSurface, payload: &[u8]) -> Result<()> {
  if payload.is_empty() {
    return Ok(());
  }

  let message: PushMessage = serde_json::from_slice(payload)
    .map_err(|e| eyre!("Failed to parse push message: {}", e))?;
  surface.show(message.into())
}

/// Open the URL carried by a clicked notification, or the app root.
pub fn handle_click(surface: &dyn NotificationSurface, notification: &Notification) -> Result<()> {
  let url = notification
    .data
    .get("url")
    .and_then(Value::as_str)
    .unwrap_or("/");
  surface.open_url(url)
}
