//! Versioned partition lifecycle: install static assets, evict old versions.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CacheVersion, PartitionKind};
use crate::http::{FetchMode, Fetcher, Request};

/// Where the list of static assets comes from.
#[derive(Debug, Clone)]
pub enum AssetManifest {
  /// Paths fixed at build/config time
  Fixed(Vec<String>),
  /// A JSON array of paths fetched at install time
  Remote(Url),
}

/// Outcome of an install pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: Vec<Url>,
  pub failed: Vec<Url>,
}

/// Outcome of an activation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  pub failed: Vec<String>,
}

pub struct CacheLifecycle<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  version: CacheVersion,
  origin: Url,
  manifest: AssetManifest,
}

impl<S: CacheStorage> CacheLifecycle<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    version: CacheVersion,
    origin: Url,
    manifest: AssetManifest,
  ) -> Self {
    Self {
      storage,
      fetcher,
      version,
      origin,
      manifest,
    }
  }

  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  /// Whether this version's static partition already exists.
  pub fn is_installed(&self) -> Result<bool> {
    let partition = self.version.partition_name(PartitionKind::Static);
    Ok(self.storage.partition_names()?.contains(&partition))
  }

  /// Resolve the manifest into absolute asset URLs.
  async fn resolve_manifest(&self) -> Result<Vec<Url>> {
    let paths = match &self.manifest {
      AssetManifest::Fixed(paths) => paths.clone(),
      AssetManifest::Remote(url) => {
        let response = self
          .fetcher
          .fetch(&Request::get(url.clone()), FetchMode::Reload)
          .await
          .map_err(|e| eyre!("Failed to fetch asset manifest {}: {:#}", url, e))?;
        if !response.is_success() {
          return Err(eyre!(
            "Asset manifest {} returned status {}",
            url,
            response.status
          ));
        }
        serde_json::from_slice::<Vec<String>>(&response.body)
          .map_err(|e| eyre!("Failed to parse asset manifest {}: {}", url, e))?
      }
    };

    paths
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
      })
      .collect()
  }

  /// Cache every manifest asset into the current static partition.
  ///
  /// Each asset is fetched with force-reload semantics and cached
  /// independently; a failing asset is logged and does not abort the rest.
  /// Only a manifest or partition failure fails the install.
  pub async fn install(&self) -> Result<InstallReport> {
    let partition = self.version.partition_name(PartitionKind::Static);
    info!("Installing {}", self.version.tag());

    let urls = self.resolve_manifest().await?;
    self.storage.open_partition(&partition)?;

    let attempts = urls.into_iter().map(|url| {
      let partition = partition.as_str();
      async move {
        let outcome = self.cache_asset(partition, &url).await;
        (url, outcome)
      }
    });

    let mut report = InstallReport::default();
    for (url, outcome) in join_all(attempts).await {
      match outcome {
        Ok(()) => report.cached.push(url),
        Err(e) => {
          warn!("Failed to cache asset {}: {:#}", url, e);
          report.failed.push(url);
        }
      }
    }

    info!(
      "Installed {}: {} cached, {} failed",
      self.version.tag(),
      report.cached.len(),
      report.failed.len()
    );
    Ok(report)
  }

  async fn cache_asset(&self, partition: &str, url: &Url) -> Result<()> {
    let request = Request::get(url.clone());
    let response = self.fetcher.fetch(&request, FetchMode::Reload).await?;
    if !response.is_success() {
      return Err(eyre!("status {}", response.status));
    }
    self.storage.put(partition, &request, &response)
  }

  /// Delete every partition not reserved by the current version.
  ///
  /// Best-effort: a failed deletion is logged and the pass continues.
  /// Deleting an already-deleted partition is a no-op.
  pub async fn activate(&self) -> Result<ActivationReport> {
    info!("Activating {}", self.version.tag());

    let mut report = ActivationReport::default();
    for name in self.storage.partition_names()? {
      if self.version.is_reserved(&name) {
        continue;
      }
      match self.storage.delete_partition(&name) {
        Ok(true) => {
          info!("Deleted old cache partition {}", name);
          report.deleted.push(name);
        }
        Ok(false) => {}
        Err(e) => {
          warn!("Failed to delete cache partition {}: {:#}", name, e);
          report.failed.push(name);
        }
      }
    }

    Ok(report)
  }
}
