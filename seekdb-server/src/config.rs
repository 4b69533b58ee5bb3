//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides
//! earlier): default values, YAML config file (if specified via
//! `SEEKDB_CONFIG`), environment variables.

use seekdb_protocol::{DEFAULT_BINARY_PORT, DEFAULT_HTTP_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub limits: Limits,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file (when `SEEKDB_CONFIG` is set), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SEEKDB_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.limits.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }
}

/// Listener and loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// HTTP listener address.
    pub http_addr: SocketAddr,
    /// Binary listener address.
    pub binary_addr: SocketAddr,
    /// Number of accept loops per listener.
    pub loops: usize,
    /// Maximum concurrent connections across both ports.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_HTTP_PORT)),
            binary_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_BINARY_PORT)),
            loops: std::thread::available_parallelism().map_or(2, |n| n.get()),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SEEKDB_HTTP_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.http_addr = parsed;
            }
        }
        if let Ok(addr) = std::env::var("SEEKDB_BINARY_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.binary_addr = parsed;
            }
        }
        if let Ok(loops) = std::env::var("SEEKDB_LOOPS") {
            if let Ok(n) = loops.parse() {
                self.loops = n;
            }
        }
        if let Ok(max) = std::env::var("SEEKDB_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Request-size and queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted HTTP body.
    pub max_body_size: u64,
    /// In-memory body threshold; bigger bodies spill to a temp file.
    pub max_body_mem: u64,
    /// Per-connection write queue capacity.
    pub write_queue_size: usize,
    /// Handler threads in the worker pool.
    pub worker_threads: usize,
    /// Worker pool job queue capacity.
    pub worker_queue_size: usize,
    /// Legacy behavior: refuse bodies that would spill to disk with 413
    /// instead of spilling.
    pub reject_spilled_bodies: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size: 250 * 1024 * 1024,
            max_body_mem: 5 * 1024 * 1024,
            write_queue_size: 10,
            worker_threads: 8,
            worker_queue_size: 256,
            reject_spilled_bodies: false,
        }
    }
}

impl Limits {
    fn apply_env_overrides(&mut self) {
        if let Ok(threads) = std::env::var("SEEKDB_WORKER_THREADS") {
            if let Ok(n) = threads.parse() {
                self.worker_threads = n;
            }
        }
        if let Ok(size) = std::env::var("SEEKDB_MAX_BODY_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_body_size = n;
            }
        }
    }
}

/// Temp-file placement and file-stream compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for body spills and received files; the process temp dir
    /// when unset.
    pub temp_dir: Option<PathBuf>,
    /// Codec for outgoing file streams on the binary port: "lz4" or
    /// "none".
    pub compression: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            compression: "lz4".to_string(),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SEEKDB_TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(dir));
        }
        if let Ok(compression) = std::env::var("SEEKDB_COMPRESSION") {
            self.compression = compression;
        }
    }

    /// Resolved temp directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Resolved file-stream codec; unknown values fall back to LZ4.
    pub fn file_codec(&self) -> seekdb_protocol::CodecType {
        match self.compression.as_str() {
            "none" => seekdb_protocol::CodecType::None,
            _ => seekdb_protocol::CodecType::Lz4,
        }
    }
}

/// Metrics toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose the registry at `/_metrics`.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SEEKDB_METRICS") {
            self.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("cannot parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.http_addr.port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.network.binary_addr.port(), DEFAULT_BINARY_PORT);
        assert_eq!(config.limits.max_body_size, 250 * 1024 * 1024);
        assert_eq!(config.limits.max_body_mem, 5 * 1024 * 1024);
        assert_eq!(config.limits.write_queue_size, 10);
        assert!(!config.limits.reject_spilled_bodies);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seekdb.yaml");
        std::fs::write(
            &path,
            "network:\n  http_addr: 0.0.0.0:9001\nlimits:\n  worker_threads: 3\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.http_addr.port(), 9001);
        assert_eq!(config.limits.worker_threads, 3);
        // Untouched sections keep defaults.
        assert_eq!(config.limits.write_queue_size, 10);
    }

    #[test]
    fn test_file_codec() {
        let mut storage = StorageConfig::default();
        assert_eq!(storage.file_codec(), seekdb_protocol::CodecType::Lz4);
        storage.compression = "none".into();
        assert_eq!(storage.file_codec(), seekdb_protocol::CodecType::None);
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, ":{nonsense").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse(_, _))
        ));
    }
}
