// Copyright (c) 2026 LibreSeed
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Daemon configuration: file values, `LIBRESEED_*` environment overrides
//! and validation. Validation failures are fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read config file {0}")]
    Read(PathBuf),
    /// Config file could not be parsed.
    #[error("cannot parse config file: {0}")]
    Parse(String),
    /// An environment override carried an unparsable value.
    #[error("invalid value for {0}")]
    InvalidEnv(String),
    /// A validated option is out of range or empty.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_listen_addr() -> String {
    "127.0.0.1:9091".to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("./libreseed")
}
fn default_dht_port() -> u16 {
    6881
}
fn default_bootstrap_nodes() -> Vec<String> {
    vec![
        "router.bittorrent.com:6881".to_string(),
        "dht.transmissionbt.com:6881".to_string(),
        "router.utorrent.com:6881".to_string(),
    ]
}
fn default_max_connections() -> u32 {
    50
}
fn default_announce_interval_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Daemon configuration root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Host+port for the HTTP request surface.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base directory for `packages/`, `keys/` and the catalogs.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// UDP port for the DHT endpoint (1024-65535).
    #[serde(default = "default_dht_port")]
    pub dht_port: u16,
    /// Seed `host:port` addresses for DHT bootstrap.
    #[serde(default = "default_bootstrap_nodes")]
    pub dht_bootstrap_nodes: Vec<String>,
    /// Upper bound on concurrent peer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Upload rate cap in bytes/s; 0 means unlimited.
    #[serde(default)]
    pub max_upload_rate: u64,
    /// Download rate cap in bytes/s; 0 means unlimited.
    #[serde(default)]
    pub max_download_rate: u64,
    /// Seconds between DHT re-announce rounds (minimum 60).
    #[serde(default = "default_announce_interval_secs", rename = "announce_interval")]
    pub announce_interval_secs: u64,
    /// Whether to run the DHT subsystem.
    #[serde(default = "default_true")]
    pub enable_dht: bool,
    /// Whether to exchange peers with connected peers.
    #[serde(default = "default_true")]
    pub enable_pex: bool,
    /// One of debug/info/warn/error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_dir: default_storage_dir(),
            dht_port: default_dht_port(),
            dht_bootstrap_nodes: default_bootstrap_nodes(),
            max_connections: default_max_connections(),
            max_upload_rate: 0,
            max_download_rate: 0,
            announce_interval_secs: default_announce_interval_secs(),
            enable_dht: true,
            enable_pex: true,
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load from a YAML file, apply environment overrides and validate.
    /// A missing `path` of `None` yields defaults plus overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|_| ConfigError::Read(p.to_path_buf()))?;
                serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `LIBRESEED_<OPTION_UPPER>` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn var(name: &str) -> Option<String> {
            std::env::var(format!("LIBRESEED_{name}")).ok().filter(|v| !v.trim().is_empty())
        }
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidEnv(name.to_string()))
        }
        fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
            match raw.trim() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ConfigError::InvalidEnv(name.to_string())),
            }
        }

        if let Some(v) = var("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DHT_PORT") {
            self.dht_port = parse("DHT_PORT", &v)?;
        }
        if let Some(v) = var("DHT_BOOTSTRAP_NODES") {
            self.dht_bootstrap_nodes =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = var("MAX_CONNECTIONS") {
            self.max_connections = parse("MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = var("MAX_UPLOAD_RATE") {
            self.max_upload_rate = parse("MAX_UPLOAD_RATE", &v)?;
        }
        if let Some(v) = var("MAX_DOWNLOAD_RATE") {
            self.max_download_rate = parse("MAX_DOWNLOAD_RATE", &v)?;
        }
        if let Some(v) = var("ANNOUNCE_INTERVAL") {
            self.announce_interval_secs = parse("ANNOUNCE_INTERVAL", &v)?;
        }
        if let Some(v) = var("ENABLE_DHT") {
            self.enable_dht = parse_bool("ENABLE_DHT", &v)?;
        }
        if let Some(v) = var("ENABLE_PEX") {
            self.enable_pex = parse_bool("ENABLE_PEX", &v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    /// Validate all option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must be non-empty".into()));
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen_addr {:?} is not host:port",
                self.listen_addr
            )));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage_dir must be non-empty".into()));
        }
        if self.dht_port < 1024 {
            return Err(ConfigError::Invalid(format!(
                "dht_port {} outside 1024-65535",
                self.dht_port
            )));
        }
        if self.enable_dht && self.dht_bootstrap_nodes.is_empty() {
            return Err(ConfigError::Invalid(
                "dht_bootstrap_nodes must be non-empty when DHT is enabled".into(),
            ));
        }
        if self.max_connections < 1 {
            return Err(ConfigError::Invalid("max_connections must be >= 1".into()));
        }
        if self.announce_interval_secs < 60 {
            return Err(ConfigError::Invalid("announce_interval must be >= 60s".into()));
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Invalid(format!("unknown log_level {other:?}")));
            }
        }
        Ok(())
    }

    /// Interval between re-announce rounds.
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    /// Directory holding ingested package containers.
    pub fn packages_dir(&self) -> PathBuf {
        self.storage_dir.join("packages")
    }

    /// Directory holding the host keypair.
    pub fn keys_dir(&self) -> PathBuf {
        self.storage_dir.join("keys")
    }

    /// Path of the package catalog.
    pub fn catalog_path(&self) -> PathBuf {
        self.storage_dir.join("packages.yaml")
    }

    /// Path of the maintainer registry.
    pub fn maintainers_path(&self) -> PathBuf {
        self.storage_dir.join("maintainers.yaml")
    }

    /// Path of the pid file.
    pub fn pid_path(&self) -> PathBuf {
        self.storage_dir.join("daemon.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DaemonConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn dht_port_range_enforced() {
        let mut cfg = DaemonConfig::default();
        cfg.dht_port = 80;
        assert!(cfg.validate().is_err());
        cfg.dht_port = 1024;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bootstrap_required_only_with_dht() {
        let mut cfg = DaemonConfig::default();
        cfg.dht_bootstrap_nodes.clear();
        assert!(cfg.validate().is_err());
        cfg.enable_dht = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn announce_interval_minimum() {
        let mut cfg = DaemonConfig::default();
        cfg.announce_interval_secs = 59;
        assert!(cfg.validate().is_err());
        cfg.announce_interval_secs = 60;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn log_level_checked() {
        let mut cfg = DaemonConfig::default();
        cfg.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        std::env::set_var("LIBRESEED_DHT_PORT", "7001");
        std::env::set_var("LIBRESEED_ENABLE_PEX", "false");
        std::env::set_var("LIBRESEED_DHT_BOOTSTRAP_NODES", "a.example:6881, b.example:6881");

        let mut cfg = DaemonConfig::default();
        cfg.apply_env_overrides().unwrap();
        assert_eq!(cfg.dht_port, 7001);
        assert!(!cfg.enable_pex);
        assert_eq!(cfg.dht_bootstrap_nodes, vec!["a.example:6881", "b.example:6881"]);

        std::env::set_var("LIBRESEED_DHT_PORT", "not-a-port");
        assert!(matches!(
            cfg.apply_env_overrides().unwrap_err(),
            ConfigError::InvalidEnv(_)
        ));

        std::env::remove_var("LIBRESEED_DHT_PORT");
        std::env::remove_var("LIBRESEED_ENABLE_PEX");
        std::env::remove_var("LIBRESEED_DHT_BOOTSTRAP_NODES");
    }
}
