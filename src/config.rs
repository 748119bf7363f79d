use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{AssetManifest, CacheVersion};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin serving the storefront and its API
  pub origin: String,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub storage: StorageConfig,
  /// File this config was read from, if any
  #[serde(skip)]
  source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Partition name prefix
  pub name: String,
  /// Deployment version; bumping it evicts every older partition
  pub version: String,
  pub api_prefix: String,
  pub offline_page: String,
  pub network_timeout_secs: u64,
  /// Static assets cached at install time
  pub manifest: Vec<String>,
  /// If set, the asset list is fetched from here instead of `manifest`
  pub manifest_url: Option<String>,
  /// How often `run` re-reads the config file looking for a new version
  pub update_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic outbox drain while online
  pub backstop_interval_secs: u64,
  /// Path polled to detect connectivity; `null` disables probing
  pub probe_path: Option<String>,
  pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Overrides $XDG_DATA_HOME/shopswift
  pub dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      storage: StorageConfig::default(),
      source: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: "shopswift".to_string(),
      version: "v1".to_string(),
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      network_timeout_secs: 10,
      manifest: [
        "/",
        "/index.html",
        "/static/js/bundle.js",
        "/static/css/main.css",
        "/manifest.json",
        "/icon-192x192.png",
        "/icon-512x512.png",
      ]
      .map(String::from)
      .to_vec(),
      manifest_url: None,
      update_check_interval_secs: 3600,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      backstop_interval_secs: 60,
      probe_path: Some("/api/".to_string()),
      probe_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shopswift.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shopswift/config.yaml
  ///
  /// Without an explicit path and with no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shopswift.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shopswift").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.source = Some(path.to_path_buf());
    Ok(config)
  }

  pub fn source(&self) -> Option<&Path> {
    self.source.as_deref()
  }

  /// Re-read the source file and return its cache version if it differs
  /// from `running`. Configs not read from a file never change.
  pub fn changed_version(&self, running: &CacheVersion) -> Result<Option<CacheVersion>> {
    let Some(path) = &self.source else {
      return Ok(None);
    };
    let latest = Self::load_from_path(path)?.cache_version();
    Ok((latest.tag() != running.tag()).then_some(latest))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Base URL of the REST namespace, always ending in a slash.
  pub fn api_base(&self) -> Result<Url> {
    let prefix = if self.cache.api_prefix.ends_with('/') {
      self.cache.api_prefix.clone()
    } else {
      format!("{}/", self.cache.api_prefix)
    };
    self
      .origin_url()?
      .join(&prefix)
      .map_err(|e| eyre!("Invalid API prefix '{}': {}", self.cache.api_prefix, e))
  }

  pub fn cache_version(&self) -> CacheVersion {
    CacheVersion::new(&self.cache.name, &self.cache.version)
  }

  pub fn manifest(&self) -> Result<AssetManifest> {
    match &self.cache.manifest_url {
      Some(url) => {
        let url = self
          .origin_url()?
          .join(url)
          .map_err(|e| eyre!("Invalid manifest URL '{}': {}", url, e))?;
        Ok(AssetManifest::Remote(url))
      }
      None => Ok(AssetManifest::Fixed(self.cache.manifest.clone())),
    }
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.cache.network_timeout_secs)
  }

  pub fn backstop_interval(&self) -> Duration {
    Duration::from_secs(self.sync.backstop_interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn update_check_interval(&self) -> Duration {
    Duration::from_secs(self.cache.update_check_interval_secs.max(1))
  }

  /// Directory for databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shopswift"))
  }

  /// Get the session token used to authenticate replayed mutations.
  ///
  /// Checks SHOPSWIFT_SESSION_TOKEN; replays go unauthenticated without it.
  pub fn get_session_token() -> Option<String> {
    std::env::var("SHOPSWIFT_SESSION_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
