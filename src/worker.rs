//! The intercepting context: lifecycle plus request handling.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::{CacheLayer, CacheLifecycle, CacheResult, CacheStorage};
use crate::event::{EventBus, WorkerEvent};
use crate::http::{FetchMode, Fetcher, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install or activation failed; the host may retry `start`
  Redundant,
}

pub struct Worker<S: CacheStorage> {
  lifecycle: CacheLifecycle<S>,
  layer: CacheLayer<S>,
  fetcher: Arc<dyn Fetcher>,
  state: watch::Sender<WorkerState>,
  events: EventBus<WorkerEvent>,
}

impl<S: CacheStorage> Worker<S> {
  pub fn new(lifecycle: CacheLifecycle<S>, layer: CacheLayer<S>, fetcher: Arc<dyn Fetcher>) -> Self {
    let (state, _rx) = watch::channel(WorkerState::Parsed);
    Self {
      lifecycle,
      layer,
      fetcher,
      state,
      events: EventBus::new(),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub fn events(&self) -> &EventBus<WorkerEvent> {
    &self.events
  }

  pub fn lifecycle(&self) -> &CacheLifecycle<S> {
    &self.lifecycle
  }

  /// Install, skip waiting, activate and claim open clients.
  ///
  /// Interception only begins once activation has finished.
  pub async fn start(&self) -> Result<()> {
    self.state.send_replace(WorkerState::Installing);
    let report = match self.lifecycle.install().await {
      Ok(report) => report,
      Err(e) => {
        error!("Install of {} failed: {:#}", self.lifecycle.version().tag(), e);
        self.state.send_replace(WorkerState::Redundant);
        self.events.emit(WorkerEvent::InstallFailed {
          error: format!("{:#}", e),
        });
        return Err(e);
      }
    };
    self.state.send_replace(WorkerState::Installed);
    self.events.emit(WorkerEvent::Installed {
      cached: report.cached.len(),
      failed: report.failed.len(),
    });

    // Skip waiting
    self.activate_and_claim().await
  }

  /// Pick up a version installed by an earlier process, evicting whatever
  /// other versions are still around before taking control.
  /// Returns false if this version still needs `start`.
  pub async fn resume(&self) -> Result<bool> {
    if self.state() == WorkerState::Activated {
      return Ok(true);
    }
    if !self.lifecycle.is_installed()? {
      return Ok(false);
    }
    self.activate_and_claim().await?;
    Ok(true)
  }

  async fn activate_and_claim(&self) -> Result<()> {
    self.state.send_replace(WorkerState::Activating);
    let activation = match self.lifecycle.activate().await {
      Ok(report) => report,
      Err(e) => {
        error!("Activation of {} failed: {:#}", self.lifecycle.version().tag(), e);
        self.state.send_replace(WorkerState::Redundant);
        self.events.emit(WorkerEvent::ActivationFailed {
          error: format!("{:#}", e),
        });
        return Err(e);
      }
    };
    self.events.emit(WorkerEvent::Activated {
      deleted: activation.deleted.len(),
    });
    self.state.send_replace(WorkerState::Activated);

    info!("{} now controls open clients", self.lifecycle.version().tag());
    self.events.emit(WorkerEvent::Claimed);
    Ok(())
  }

  /// Handle a request from a page. Before activation completes requests go
  /// straight to the network.
  pub async fn handle_fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    if self.state() != WorkerState::Activated {
      let response = self.fetcher.fetch(request, FetchMode::Default).await?;
      return Ok(CacheResult::from_network(response));
    }
    self.layer.handle(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{AssetManifest, CacheSource, CacheVersion, CachedResponse, SqliteStorage};
  use crate::test_support::ScriptedFetcher;
  use url::Url;

  fn worker(
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<ScriptedFetcher>,
    manifest: AssetManifest,
  ) -> Worker<SqliteStorage> {
    let version = CacheVersion::new("shopswift", "v2");
    let lifecycle = CacheLifecycle::new(
      Arc::clone(storage),
      fetcher.clone(),
      version.clone(),
      Url::parse("https://shop.test/").unwrap(),
      manifest,
    );
    let layer = CacheLayer::new(Arc::clone(storage), fetcher.clone(), version);
    Worker::new(lifecycle, layer, fetcher.clone())
  }

  #[tokio::test]
  async fn test_start_installs_then_activates() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("https://shop.test/index.html", 200, "text/html", "<shell>");
    storage.open_partition("shopswift-v1-api").unwrap();
    let worker = worker(
      &storage,
      &fetcher,
      AssetManifest::Fixed(vec!["/index.html".into()]),
    );
    let (_sub, mut rx) = worker.events().channel();

    worker.start().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(storage.partition_names().unwrap(), vec!["shopswift-v2"]);
    assert_eq!(
      rx.recv().await,
      Some(WorkerEvent::Installed {
        cached: 1,
        failed: 0
      })
    );
    assert_eq!(rx.recv().await, Some(WorkerEvent::Activated { deleted: 1 }));
    assert_eq!(rx.recv().await, Some(WorkerEvent::Claimed));
  }

  #[tokio::test]
  async fn test_failed_install_leaves_worker_redundant() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    storage.open_partition("shopswift-v1").unwrap();
    let remote = Url::parse("https://shop.test/asset-manifest.json").unwrap();
    let worker = worker(&storage, &fetcher, AssetManifest::Remote(remote));

    assert!(worker.start().await.is_err());

    assert_eq!(worker.state(), WorkerState::Redundant);
    // Old partitions survive until a successful activation
    assert_eq!(storage.partition_names().unwrap(), vec!["shopswift-v1"]);
  }

  #[tokio::test]
  async fn test_resume_requires_installed_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let fresh = worker(&storage, &fetcher, AssetManifest::Fixed(Vec::new()));
    assert!(!fresh.resume().await.unwrap());
    assert_eq!(fresh.state(), WorkerState::Parsed);

    fresh.start().await.unwrap();

    let restarted = worker(&storage, &fetcher, AssetManifest::Fixed(Vec::new()));
    assert!(restarted.resume().await.unwrap());
    assert_eq!(restarted.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_resume_after_bare_install_evicts_old_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let page = Request::get(Url::parse("https://shop.test/index.html").unwrap());
    storage
      .put("shopswift-v1", &page, &Response::new(200, "text/html", "<v1>"))
      .unwrap();
    storage.open_partition("shopswift-v1-api").unwrap();
    fetcher.respond(page.url.as_str(), 200, "text/html", "<v2>");
    let worker = worker(
      &storage,
      &fetcher,
      AssetManifest::Fixed(vec!["/index.html".into()]),
    );

    worker.lifecycle().install().await.unwrap();
    assert!(worker.resume().await.unwrap());

    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(storage.partition_names().unwrap(), vec!["shopswift-v2"]);
    fetcher.set_offline(true);
    let served = worker.handle_fetch(&page).await.unwrap();
    assert_eq!(served.data.text(), "<v2>");
  }

  /// Partition storage whose listing always fails.
  struct UnlistableStorage(SqliteStorage);

  impl CacheStorage for UnlistableStorage {
    fn open_partition(&self, name: &str) -> Result<()> {
      self.0.open_partition(name)
    }

    fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
      self.0.put(partition, request, response)
    }

    fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>> {
      self.0.match_in(partition, request)
    }

    fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
      self.0.match_any(request)
    }

    fn partition_names(&self) -> Result<Vec<String>> {
      Err(color_eyre::eyre::eyre!("disk I/O error"))
    }

    fn delete_partition(&self, name: &str) -> Result<bool> {
      self.0.delete_partition(name)
    }

    fn entry_count(&self, partition: &str) -> Result<usize> {
      self.0.entry_count(partition)
    }
  }

  #[tokio::test]
  async fn test_failed_activation_leaves_worker_redundant() {
    let storage = Arc::new(UnlistableStorage(SqliteStorage::open_in_memory().unwrap()));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let version = CacheVersion::new("shopswift", "v2");
    let lifecycle = CacheLifecycle::new(
      Arc::clone(&storage),
      fetcher.clone(),
      version.clone(),
      Url::parse("https://shop.test/").unwrap(),
      AssetManifest::Fixed(Vec::new()),
    );
    let layer = CacheLayer::new(Arc::clone(&storage), fetcher.clone(), version);
    let worker = Worker::new(lifecycle, layer, fetcher.clone());
    let (_sub, mut rx) = worker.events().channel();

    assert!(worker.start().await.is_err());

    assert_eq!(worker.state(), WorkerState::Redundant);
    assert_eq!(
      rx.recv().await,
      Some(WorkerEvent::Installed {
        cached: 0,
        failed: 0
      })
    );
    assert!(matches!(
      rx.recv().await,
      Some(WorkerEvent::ActivationFailed { .. })
    ));
  }

  #[tokio::test]
  async fn test_requests_pass_through_until_activated() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("https://shop.test/logo.png", 200, "image/png", "png");
    let worker = worker(&storage, &fetcher, AssetManifest::Fixed(Vec::new()));
    let request = Request::get(Url::parse("https://shop.test/logo.png").unwrap());

    worker.handle_fetch(&request).await.unwrap();
    assert!(storage.match_any(&request).unwrap().is_none());

    worker.start().await.unwrap();
    let result = worker.handle_fetch(&request).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(storage
      .match_in("shopswift-v2-images", &request)
      .unwrap()
      .is_some());
  }
}
