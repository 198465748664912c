//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var or token_file,
//! never stored in the TOML directly to avoid leaking secrets.

use code_rotation::{ExhaustionPolicy, RotationPolicy};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Admin listener, disabled when the section is absent
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

/// Public HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where the pool document lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    JsonFile,
    /// Nothing survives a restart
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// Rotation tunables
#[derive(Debug, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_pages")]
    pub pages: u8,
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    #[serde(default = "default_wait_days")]
    pub wait_days: i64,
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,
    /// Background recycling sweep; off when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            pages: default_pages(),
            cutoff_hour: default_cutoff_hour(),
            wait_days: default_wait_days(),
            exhaustion: ExhaustionPolicy::default(),
            sweep_interval_secs: None,
        }
    }
}

impl RotationConfig {
    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy {
            pages: self.pages,
            cutoff_hour: self.cutoff_hour,
            wait_days: self.wait_days,
            exhaustion: self.exhaustion,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

/// Admin API listener settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the bearer token (alternative to ADMIN_TOKEN)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("codes.json")
}

fn default_pages() -> u8 {
    4
}

fn default_cutoff_hour() -> u32 {
    1
}

fn default_wait_days() -> i64 {
    20
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin token resolution order:
    /// 1. ADMIN_TOKEN env var
    /// 2. token_file path from the [admin] section
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(admin) = config.admin.as_mut() {
            if let Ok(token) = std::env::var("ADMIN_TOKEN") {
                admin.token = Some(Secret::new(token));
            } else if let Some(ref token_file) = admin.token_file {
                let token = std::fs::read_to_string(token_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read token_file {}: {e}",
                        token_file.display()
                    ))
                })?;
                let token = token.trim().to_owned();
                if !token.is_empty() {
                    admin.token = Some(Secret::new(token));
                }
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.store.backend == StoreBackend::JsonFile && self.store.path.as_os_str().is_empty() {
            return Err(common::Error::Config(
                "store.path must not be empty for the json-file backend".into(),
            ));
        }

        let rotation = &self.rotation;
        if rotation.pages == 0 {
            return Err(common::Error::Config(
                "rotation.pages must be at least 1".into(),
            ));
        }
        if rotation.cutoff_hour > 23 {
            return Err(common::Error::Config(format!(
                "rotation.cutoff_hour must be 0-23, got: {}",
                rotation.cutoff_hour
            )));
        }
        if rotation.wait_days < 0 {
            return Err(common::Error::Config(format!(
                "rotation.wait_days must not be negative, got: {}",
                rotation.wait_days
            )));
        }
        if rotation.sweep_interval_secs == Some(0) {
            return Err(common::Error::Config(
                "rotation.sweep_interval_secs must be greater than 0".into(),
            ));
        }

        if let Some(admin) = &self.admin {
            if admin.listen_addr == self.server.listen_addr {
                return Err(common::Error::Config(
                    "admin.listen_addr must differ from server.listen_addr".into(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("code-server.toml")
    }
}
