use std::sync::Arc;

use url::Url;

use common::auth::Authorizer;
use common::fsm::{FsRegistry, LocalEngine, MachineContext, Notification};
use common::master::MasterStore;
use common::observer::Observer;

use crate::auth::authorizer_for;
use crate::config::{Config, KvBackend};
#[cfg(feature = "etcd")]
use crate::database::EtcdKv;
use crate::database::{ClusterKv, Database, DatabaseSetupError, SqliteKv};
use crate::plugin::ContainerMounts;

/// Main service state, shared by both HTTP surfaces
#[derive(Debug, Clone)]
pub struct State {
    database: Database,
    registry: FsRegistry<ClusterKv>,
    mounts: ContainerMounts,
    authorizer: Arc<dyn Authorizer>,
}

impl State {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        // 1. Setup database
        let sqlite_database_url = match config.sqlite_path {
            Some(ref path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.exists() {
                        return Err(StateSetupError::DatabasePathDoesNotExist);
                    }
                }
                Url::parse(&format!("sqlite://{}", path.display()))
                    .map_err(|_| StateSetupError::InvalidDatabaseUrl)
            }
            // otherwise just set up an in-memory database
            None => Url::parse("sqlite::memory:").map_err(|_| StateSetupError::InvalidDatabaseUrl),
        }?;
        tracing::info!("Database URL: {:?}", sqlite_database_url);
        let database = Database::connect(&sqlite_database_url).await?;

        // 2. Setup the filesystem machines
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| StateSetupError::DataDir(e.to_string()))?;
        let kv = match config.kv_backend {
            KvBackend::Sqlite => {
                ClusterKv::Sqlite(SqliteKv::new(database.clone(), config.kv_prefix.clone()))
            }
            KvBackend::Etcd => connect_etcd(config).await?,
        };
        let ctx = MachineContext {
            engine: Arc::new(LocalEngine::new(config.data_dir.clone())),
            masters: MasterStore::new(kv),
            observer: Observer::<Notification>::with_stall_timeout(
                "dots",
                config.observer_stall(),
            ),
            node_id: config.node_id(),
            backoff: config.backoff(),
        };
        let registry = FsRegistry::new(ctx);
        tracing::info!(node_id = %registry.node_id(), data_dir = %config.data_dir.display(), "registry ready");

        // 3. Setup authorization
        let authorizer = authorizer_for(config.authorization_url.as_deref())
            .map_err(|e| StateSetupError::InvalidAuthorizationUrl(e.to_string()))?;

        Ok(Self {
            database,
            registry,
            mounts: ContainerMounts::new(config.container_mount_prefix.clone()),
            authorizer,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn registry(&self) -> &FsRegistry<ClusterKv> {
        &self.registry
    }

    pub fn mounts(&self) -> &ContainerMounts {
        &self.mounts
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &Config) -> Result<ClusterKv, StateSetupError> {
    EtcdKv::connect(&config.etcd_endpoints, config.kv_prefix.clone())
        .await
        .map(ClusterKv::Etcd)
        .map_err(|e| StateSetupError::Kv(e.to_string()))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &Config) -> Result<ClusterKv, StateSetupError> {
    Err(StateSetupError::Kv(
        "etcd support is not compiled in; rebuild with the `etcd` feature".to_string(),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("Database path does not exist")]
    DatabasePathDoesNotExist,
    #[error("Invalid database URL")]
    InvalidDatabaseUrl,
    #[error("Database setup error: {0}")]
    DatabaseSetupError(#[from] DatabaseSetupError),
    #[error("failed to create data dir: {0}")]
    DataDir(String),
    #[error("invalid authorization url: {0}")]
    InvalidAuthorizationUrl(String),
    #[error("cluster store unavailable: {0}")]
    Kv(String),
}
