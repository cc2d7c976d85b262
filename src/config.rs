use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CacheSettings;
use crate::page::PageParams;
use crate::session::SessionSettings;
use crate::transport::Credentials;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub pagination: PageParams,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
  /// No Authorization header
  None,
  /// Bearer token from MESHDASH_API_TOKEN
  #[default]
  Bearer,
  /// Basic auth: configured username, password from MESHDASH_PASSWORD
  Basic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every request path is joined onto
  pub url: String,
  #[serde(default)]
  pub auth_type: AuthType,
  /// Username for basic auth
  pub username: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds before resolved data is refetched on next observation
  pub stale_seconds: u64,
  /// Maximum number of cached request keys
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_seconds: 300,
      max_entries: crate::cache::DEFAULT_CAPACITY,
    }
  }
}

impl Config {
  /// Load configuration from `explicit_path`, or else from the first of
  /// `./meshdash.yaml` and `<config_dir>/meshdash/config.yaml` that exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match explicit_path {
      Some(p) if !p.exists() => Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Self::load_from_path(p),
      None => {
        let path = Self::find_config_file().ok_or_else(|| {
          eyre!("No configuration file found. See config.example.yaml for the format.")
        })?;
        Self::load_from_path(&path)
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("meshdash.yaml");
    let user = dirs::config_dir().map(|dir| dir.join("meshdash").join("config.yaml"));
    std::iter::once(local).chain(user).find(|path| path.exists())
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    if config.pagination.default_limit == 0 {
      return Err(eyre!("pagination.default_limit must be at least 1"));
    }
    Ok(config)
  }

  /// Bearer token from MESHDASH_API_TOKEN.
  pub fn get_api_token() -> Result<String> {
    env_secret(TOKEN_VAR)
  }

  /// Basic auth password from MESHDASH_PASSWORD.
  pub fn get_password() -> Result<String> {
    env_secret(PASSWORD_VAR)
  }

  /// Credentials for the configured auth type.
  pub fn credentials(&self) -> Result<Credentials> {
    match self.api.auth_type {
      AuthType::None => Ok(Credentials::None),
      AuthType::Bearer => Ok(Credentials::Bearer(Self::get_api_token()?)),
      AuthType::Basic => {
        let username = self
          .api
          .username
          .clone()
          .ok_or_else(|| eyre!("api.username is required for basic auth"))?;
        Ok(Credentials::Basic {
          username,
          password: Self::get_password()?,
        })
      }
    }
  }

  /// Session settings, with credentials resolved from the environment.
  pub fn session_settings(&self) -> Result<SessionSettings> {
    let cache = CacheSettings::default()
      .with_capacity(self.cache.max_entries)
      .with_stale_time(chrono::Duration::seconds(
        i64::try_from(self.cache.stale_seconds).unwrap_or(i64::MAX),
      ))
      .with_credentials(self.credentials()?);

    Ok(SessionSettings {
      cache,
      pages: self.pagination.clone(),
    })
  }
}

const TOKEN_VAR: &str = "MESHDASH_API_TOKEN";
const PASSWORD_VAR: &str = "MESHDASH_PASSWORD";

/// Secrets never live in the config file.
fn env_secret(var: &str) -> Result<String> {
  match std::env::var(var) {
    Ok(value) if !value.trim().is_empty() => Ok(value),
    _ => Err(eyre!("{} is not set", var)),
  }
}
