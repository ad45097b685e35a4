// Node services
pub mod auth;
pub mod config;
pub(crate) mod database;
pub mod http_server;
pub mod plugin;
pub mod process;
pub mod state;

// Re-exports for consumers
pub use config::Config;
pub use database::{ClusterKv, ClusterKvError, Database, EtcdLayout, SqliteKv};
#[cfg(feature = "etcd")]
pub use database::EtcdKv;
pub use process::{spawn_service, start_service, ServiceError, ShutdownHandle};
pub use state::State as ServiceState;
