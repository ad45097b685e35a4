use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use common::types::NodeId;

pub const DEFAULT_PLUGIN_LISTEN_ADDR: &str = "127.0.0.1:6970";
pub const DEFAULT_API_LISTEN_ADDR: &str = "127.0.0.1:6969";

/// Which store holds master records and the name registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// The node's own SQLite database; single node only
    #[default]
    Sqlite,
    /// An etcd cluster shared with the other nodes
    Etcd,
}

/// Node configuration, read from a TOML file. Every field has a default, so
///  an empty file describes a working single-node setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this node in the master records. Defaults to the hostname.
    pub node_id: String,
    /// Root of live filesystems and their snapshots
    pub data_dir: PathBuf,
    /// Where per-volume symlinks handed to containers are created
    pub container_mount_prefix: PathBuf,
    pub kv_backend: KvBackend,
    /// Cluster members, for `kv_backend = "etcd"`
    pub etcd_endpoints: Vec<String>,
    /// SQLite file backing cluster state; in-memory when unset
    pub sqlite_path: Option<PathBuf>,
    /// Namespace prepended to every key this node writes
    pub kv_prefix: String,
    pub plugin_listen_addr: SocketAddr,
    /// Directory docker scans for plugin `.spec` files
    pub plugin_spec_dir: Option<PathBuf>,
    pub api_listen_addr: SocketAddr,
    /// Remote user/authorization service; everything is allowed when unset
    pub authorization_url: Option<String>,
    pub backoff_secs: u64,
    pub observer_stall_secs: u64,
    /// Seconds between master record reconciliations
    pub master_poll_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: PathBuf::from("/var/lib/dots"),
            container_mount_prefix: PathBuf::from("/var/dots/mnt"),
            kv_backend: KvBackend::Sqlite,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            sqlite_path: None,
            kv_prefix: "dots.io".to_string(),
            plugin_listen_addr: DEFAULT_PLUGIN_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 6970))),
            plugin_spec_dir: None,
            api_listen_addr: DEFAULT_API_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 6969))),
            authorization_url: None,
            backoff_secs: 1,
            observer_stall_secs: 600,
            master_poll_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid log level: {0}")]
    LogLevel(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from(self.node_id.as_str())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn observer_stall(&self) -> Duration {
        Duration::from_secs(self.observer_stall_secs)
    }

    pub fn master_poll_interval(&self) -> Duration {
        Duration::from_secs(self.master_poll_secs.max(1))
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }
}

/// `config.toml` in the platform's per-user config directory
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "dots", "dots").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
