use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{
  ActivationReport, CacheLayer, CacheLifecycle, CacheResult, InstallReport, SqliteStorage,
};
use crate::config::Config;
use crate::event::{SyncEvent, WorkerEvent};
use crate::http::{Destination, Fetcher, HttpFetcher, Request, Response};
use crate::notify::{self, LogSurface, Notification, PushMessage};
use crate::store::{ActionKind, LocalStore, Order, PendingAction, Product, StoreProfile};
use crate::sync::{
  Connectivity, ConnectivityMonitor, DrainReport, Replayer, SubmitOutcome, Synchronizer,
};
use crate::worker::Worker;

const INSTALL_ATTEMPTS: u32 = 3;
const INSTALL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Wires the cache, local store and synchronizer together for one process.
pub struct App {
  config: Config,
  origin: Url,
  fetcher: Arc<dyn Fetcher>,
  store: LocalStore,
  worker: Worker<SqliteStorage>,
  sync: Arc<Synchronizer>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
    Self::with_fetcher(config, fetcher)
  }

  pub fn with_fetcher(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
    let origin = config.origin_url()?;
    let data_dir = config.data_dir()?;

    let storage = Arc::new(SqliteStorage::open(&data_dir.join("cache.db"))?);
    let store = LocalStore::open(&data_dir.join("local.db"))?;

    let version = config.cache_version();
    let lifecycle = CacheLifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      version.clone(),
      origin.clone(),
      config.manifest()?,
    );
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher), version)
      .with_api_prefix(&config.cache.api_prefix)
      .with_offline_page(&config.cache.offline_page)
      .with_network_timeout(config.network_timeout());
    let worker = Worker::new(lifecycle, layer, Arc::clone(&fetcher));

    // Assume online until the first probe says otherwise
    let connectivity = ConnectivityMonitor::new(Connectivity::Online);
    let replayer = Replayer::new(config.api_base()?, Config::get_session_token());
    let sync = Arc::new(Synchronizer::new(
      store.clone(),
      Arc::clone(&fetcher),
      replayer,
      connectivity,
    ));

    Ok(Self {
      config,
      origin,
      fetcher,
      store,
      worker,
      sync,
    })
  }

  pub async fn install(&self) -> Result<InstallReport> {
    self.worker.lifecycle().install().await
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.worker.lifecycle().activate().await
  }

  /// Fetch a path or absolute URL through the strategy engine.
  pub async fn fetch(&self, target: &str, navigate: bool, image: bool) -> Result<CacheResult<Response>> {
    let url = self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))?;

    let request = if navigate {
      Request::navigate(url)
    } else if image {
      Request::get(url).with_destination(Destination::Image)
    } else {
      Request::get(url)
    };

    if !self.worker.resume().await? {
      self.worker.start().await?;
    }
    self.worker.handle_fetch(&request).await
  }

  pub async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    self.store.list_pending_actions().await
  }

  pub async fn enqueue(&self, action: ActionKind, payload: &str) -> Result<i64> {
    let payload: serde_json::Value =
      serde_json::from_str(payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
    self.store.enqueue_pending_action(action, payload).await
  }

  /// Send a mutation now, or queue it if the origin is unreachable.
  pub async fn submit(&self, action: ActionKind, payload: &str) -> Result<SubmitOutcome> {
    let payload: serde_json::Value =
      serde_json::from_str(payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
    self.sync.submit(action, payload).await
  }

  pub async fn drain(&self) -> Result<DrainReport> {
    self.sync.drain().await
  }

  /// Wipe every local collection and outbox entry.
  pub async fn reset(&self) -> Result<()> {
    self.store.clear_all().await
  }

  pub fn push(&self, payload: &str) -> Result<()> {
    notify::handle_push(&LogSurface, payload.as_bytes())
  }

  /// Act on a click on the notification built from `payload`.
  pub fn click(&self, payload: &str) -> Result<()> {
    let message: PushMessage = serde_json::from_str(payload)
      .map_err(|e| eyre!("Failed to parse notification payload: {}", e))?;
    notify::handle_click(&LogSurface, &Notification::from(message))
  }

  /// Mirror products fetched elsewhere (a JSON array) into the local store.
  pub async fn import_products(&self, json: &str) -> Result<usize> {
    let products: Vec<Product> =
      serde_json::from_str(json).map_err(|e| eyre!("Failed to parse products: {}", e))?;
    self.store.save_entities(&products).await?;
    Ok(products.len())
  }

  pub async fn import_orders(&self, json: &str) -> Result<usize> {
    let orders: Vec<Order> =
      serde_json::from_str(json).map_err(|e| eyre!("Failed to parse orders: {}", e))?;
    self.store.save_entities(&orders).await?;
    Ok(orders.len())
  }

  pub async fn import_profile(&self, json: &str) -> Result<()> {
    let profile: StoreProfile =
      serde_json::from_str(json).map_err(|e| eyre!("Failed to parse store profile: {}", e))?;
    self.store.save_owner_profile(&profile).await
  }

  /// Products of a store, optionally narrowed to one category.
  pub async fn products(&self, store_id: &str, category: Option<&str>) -> Result<Vec<Product>> {
    match category {
      Some(category) => self.store.get_entities_by_index(store_id, category).await,
      None => self.store.get_entities_by_owner(store_id).await,
    }
  }

  /// Orders of a store, optionally narrowed to one status.
  pub async fn orders(&self, store_id: &str, status: Option<&str>) -> Result<Vec<Order>> {
    match status {
      Some(status) => self.store.get_entities_by_index(store_id, status).await,
      None => self.store.get_entities_by_owner(store_id).await,
    }
  }

  pub async fn profile(&self, store_id: &str) -> Result<Option<StoreProfile>> {
    self.store.get_owner_profile(store_id).await
  }

  /// Start the worker and the synchronizer and serve until Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    let _worker_events = self.worker.events().subscribe(|event: &WorkerEvent| {
      info!("Worker event: {:?}", event);
    });
    let _sync_events = self.sync.events().subscribe(|event: &SyncEvent| match event {
      SyncEvent::DrainFailed { error, .. } => warn!("Sync halted: {}", error),
      other => info!("Sync event: {:?}", other),
    });

    self.start_with_retry().await?;
    let tasks = self.spawn_background().await?;

    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Shutting down");

    for task in tasks {
      task.abort();
    }
    self.worker.events().clear();
    self.sync.events().clear();
    self.store.close().await
  }

  /// Seed connectivity with one probe, then start the periodic probe, the
  /// synchronizer loop and the update check.
  async fn spawn_background(&self) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    if let Some(path) = &self.config.sync.probe_path {
      let url = self
        .origin
        .join(path)
        .map_err(|e| eyre!("Invalid probe path '{}': {}", path, e))?;
      let connectivity = self.sync.connectivity();
      let initial = connectivity
        .probe(self.fetcher.as_ref(), &url, self.config.network_timeout())
        .await;
      info!("Starting {:?}", initial);
      tasks.push(connectivity.spawn_probe(
        Arc::clone(&self.fetcher),
        url,
        self.config.probe_interval(),
      ));
    }

    tasks.push(tokio::spawn(
      Arc::clone(&self.sync).run(self.config.backstop_interval()),
    ));

    if let Some(task) = self.spawn_update_check() {
      tasks.push(task);
    }
    Ok(tasks)
  }

  /// Periodically re-read the config file and announce a new cache version.
  /// Installing it takes a restart, which runs install and activation again.
  fn spawn_update_check(&self) -> Option<JoinHandle<()>> {
    self.config.source()?;

    let config = self.config.clone();
    let running = self.config.cache_version();
    let events = self.worker.events().clone();
    let interval = self.config.update_check_interval();

    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // First tick completes immediately
      ticker.tick().await;
      let mut announced: Option<String> = None;

      loop {
        ticker.tick().await;
        match config.changed_version(&running) {
          Ok(Some(latest)) => {
            let tag = latest.tag();
            if announced.as_deref() != Some(tag.as_str()) {
              info!("{} is available; restart to install it", tag);
              events.emit(WorkerEvent::UpdateAvailable {
                version: tag.clone(),
              });
              announced = Some(tag);
            }
          }
          Ok(None) => {}
          Err(e) => warn!("Update check failed: {:#}", e),
        }
      }
    }))
  }

  async fn start_with_retry(&self) -> Result<()> {
    let mut attempt = 1;
    loop {
      match self.worker.start().await {
        Ok(()) => return Ok(()),
        Err(e) if attempt < INSTALL_ATTEMPTS => {
          error!("Worker start attempt {} failed: {:#}", attempt, e);
          attempt += 1;
          tokio::time::sleep(INSTALL_RETRY_DELAY).await;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::ScriptedFetcher;

  fn app(dir: &tempfile::TempDir) -> App {
    let mut config = Config::default();
    config.storage.dir = Some(dir.path().to_path_buf());
    App::new(config).unwrap()
  }

  #[tokio::test]
  async fn test_imported_products_are_queryable_by_category() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    let imported = app
      .import_products(
        r#"[
          {"product_id": "p1", "store_id": "s1", "name": "Tea", "price": 4.5, "category": "drinks"},
          {"product_id": "p2", "store_id": "s1", "name": "Rice", "price": 2.0, "category": "grains"},
          {"product_id": "p3", "store_id": "s2", "name": "Milk", "price": 1.0, "category": "drinks"}
        ]"#,
      )
      .await
      .unwrap();

    assert_eq!(imported, 3);
    assert_eq!(app.products("s1", None).await.unwrap().len(), 2);
    let drinks = app.products("s1", Some("drinks")).await.unwrap();
    assert_eq!(drinks.len(), 1);
    assert_eq!(drinks[0].product_id, "p1");
  }

  #[tokio::test]
  async fn test_reset_clears_profile_and_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);
    app
      .import_profile(r#"{"store_id": "s1", "user_id": "u1", "store_name": "Corner", "subdomain": "corner"}"#)
      .await
      .unwrap();
    app
      .enqueue(ActionKind::DeleteProduct, r#"{"product_id": "p1"}"#)
      .await
      .unwrap();

    app.reset().await.unwrap();

    assert!(app.profile("s1").await.unwrap().is_none());
    assert!(app.pending_actions().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_background_start_detects_offline_then_drains_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.dir = Some(dir.path().to_path_buf());
    config.sync.probe_interval_secs = 1;
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.set_offline(true);
    let app = App::with_fetcher(config, fetcher.clone()).unwrap();
    app
      .enqueue(ActionKind::DeleteProduct, r#"{"product_id": "p1"}"#)
      .await
      .unwrap();

    let tasks = app.spawn_background().await.unwrap();
    assert!(!app.sync.connectivity().is_online());
    assert_eq!(app.pending_actions().await.unwrap().len(), 1);

    fetcher.respond("http://localhost:3000/api/", 200, "application/json", "{}");
    fetcher.respond(
      "http://localhost:3000/api/products/p1",
      200,
      "application/json",
      "{}",
    );
    fetcher.set_offline(false);

    tokio::time::timeout(Duration::from_secs(5), async {
      while !app.pending_actions().await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
    })
    .await
    .unwrap();

    assert!(app.sync.connectivity().is_online());
    assert!(fetcher
      .calls()
      .contains(&"DELETE http://localhost:3000/api/products/p1".to_string()));
    for task in tasks {
      task.abort();
    }
  }

  #[tokio::test]
  async fn test_update_check_announces_new_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shopswift.yaml");
    let yaml = |version: &str| {
      format!(
        "cache:\n  version: {}\n  update_check_interval_secs: 1\nstorage:\n  dir: {}\n",
        version,
        dir.path().display()
      )
    };
    std::fs::write(&path, yaml("v1")).unwrap();
    let config = Config::load(Some(&path)).unwrap();
    let app = App::with_fetcher(config, Arc::new(ScriptedFetcher::new())).unwrap();
    let (_sub, mut rx) = app.worker.events().channel();

    let task = app.spawn_update_check().unwrap();
    std::fs::write(&path, yaml("v2")).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap();
    assert_eq!(
      event,
      Some(WorkerEvent::UpdateAvailable {
        version: "shopswift-v2".to_string()
      })
    );
    task.abort();
  }

  #[tokio::test]
  async fn test_invalid_payloads_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    assert!(app.enqueue(ActionKind::CreateProduct, "not json").await.is_err());
    assert!(app.click(r#"{"body": "missing title"}"#).is_err());
    assert!(app.click(r#"{"title": "New order", "data": {"url": "/orders"}}"#).is_ok());
  }
}
