//! TOML configuration for the admin engine.
//!
//! ```toml
//! listen = "127.0.0.1:8081"
//! shm_dir = "/dev/shm"
//!
//! [[upstream]]
//! name = "backend"
//! port = 8080
//! zone = "backend_pool"
//! zone_size = 65536
//!
//! [[upstream.server]]
//! address = "10.0.0.1:8080"
//! weight = 5
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use upzone_core::shm::{DEFAULT_SEGMENT_SIZE, MAX_NAME_LEN, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};

/// Configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the admin RPC listener.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Directory holding segment files when an upstream names no path.
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    /// Upstreams in declaration order.
    #[serde(default, rename = "upstream")]
    pub upstreams: Vec<UpstreamConfig>,
}

/// One upstream block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Upstream name.
    pub name: String,
    /// Port suffix shown in zone listings.
    pub port: Option<u16>,
    /// Shared zone name. Without one the upstream is static.
    pub zone: Option<String>,
    /// Size of the shared segment in bytes.
    #[serde(default = "default_zone_size")]
    pub zone_size: usize,
    /// Explicit segment file, overriding `shm_dir`.
    pub zone_path: Option<PathBuf>,
    /// Statically configured servers.
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

/// One `server` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// `host:port`, `host` or `unix:/path`.
    pub address: String,
    /// Weight, at least 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Failure threshold.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// Failure window in seconds.
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,
    /// Start administratively down.
    #[serde(default)]
    pub down: bool,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_zone_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> u64 {
    10
}

impl Config {
    /// Read and validate the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut zones = HashSet::new();

        for upstream in &self.upstreams {
            if !names.insert(upstream.name.as_str()) {
                return invalid(format!("duplicate upstream {:?}", upstream.name));
            }

            if let Some(zone) = &upstream.zone {
                if zone.is_empty() || zone.len() > MAX_NAME_LEN {
                    return invalid(format!(
                        "upstream {:?}: zone name must be 1..={MAX_NAME_LEN} bytes",
                        upstream.name
                    ));
                }
                if !zones.insert(zone.as_str()) {
                    return invalid(format!("duplicate zone {zone:?}"));
                }
                if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&upstream.zone_size) {
                    return invalid(format!(
                        "upstream {:?}: zone_size must be {MIN_SEGMENT_SIZE}..={MAX_SEGMENT_SIZE}",
                        upstream.name
                    ));
                }
            }

            if let Some(server) = upstream.servers.iter().find(|s| s.weight == 0) {
                return invalid(format!(
                    "upstream {:?}: server {:?} has weight 0",
                    upstream.name, server.address
                ));
            }
        }

        Ok(())
    }
}

impl UpstreamConfig {
    /// Segment file for this upstream's zone, if it has one.
    pub fn segment_path(&self, shm_dir: &Path) -> Option<PathBuf> {
        let zone = self.zone.as_ref()?;
        Some(
            self.zone_path
                .clone()
                .unwrap_or_else(|| shm_dir.join(format!("{zone}.zone"))),
        )
    }
}

fn invalid<T>(message: String) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message))
}
