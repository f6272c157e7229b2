use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub rally: RallyConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RallyConfig {
  /// Rally server URL (e.g. "https://rally1.rallydev.com")
  pub url: String,
  /// Workspace name the client operates in
  pub workspace: String,
  /// Project name within the workspace
  pub project: String,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub request_timeout_secs: u64,
  /// Concurrent-connection ceiling documented by the Rally service
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Whether the local snapshot cache is used at all
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Minutes before a snapshot is considered stale
  #[serde(default = "default_ttl_minutes")]
  pub ttl_minutes: u64,
  /// Override for the cache directory (defaults to the per-user one)
  pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_minutes: default_ttl_minutes(),
      dir: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_ttl_minutes() -> u64 {
  5
}

fn default_timeout_secs() -> u64 {
  20
}

fn default_max_concurrent() -> usize {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./r9s.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/r9s/config.yaml
  /// 4. ~/.config/r9s/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(
        "No configuration file found. Create one at ~/.config/r9s/config.yaml\n\
                 See config.example.yaml for the format."
          .to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("r9s.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("r9s").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
      Error::Config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })?;

    config.validate()?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.rally.max_concurrent_requests == 0 {
      return Err(Error::Config(
        "rally.max_concurrent_requests must be greater than zero".to_string(),
      ));
    }
    if self.rally.request_timeout_secs == 0 {
      return Err(Error::Config(
        "rally.request_timeout_secs must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }

  /// Get the Rally API key from environment variables.
  ///
  /// Checks R9S_RALLY_API_KEY first, then RALLY_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("R9S_RALLY_API_KEY")
      .or_else(|_| std::env::var("RALLY_API_KEY"))
      .map_err(|_| {
        Error::Config(
          "Rally API key not found. Set R9S_RALLY_API_KEY or RALLY_API_KEY environment variable."
            .to_string(),
        )
      })
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.rally.request_timeout_secs)
  }

  pub fn cache_ttl(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.cache.ttl_minutes as i64)
  }
}
