//! Storage for cluster state.
//!
//! [`SqliteKv`] keeps the key-value tables in the node's SQLite database,
//! which is the whole cluster store for a single node. Nodes that share
//! master records point at the same etcd cluster through `EtcdKv` instead
//! (behind the `etcd` feature). [`ClusterKv`] is whichever one the config
//! picked.

mod cluster;
mod etcd;
mod kv;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use url::Url;

pub use cluster::{ClusterKv, ClusterKvError};
#[cfg(feature = "etcd")]
pub use etcd::EtcdKv;
pub use etcd::EtcdLayout;
pub use kv::SqliteKv;

/// Connection pool to the node's SQLite database
#[derive(Debug, Clone)]
pub struct Database(SqlitePool);

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("invalid database url {0}")]
    InvalidUrl(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
}

impl Database {
    /// Open the database at `url`, creating it and its tables as needed.
    ///
    /// `sqlite::memory:` opens a private in-memory database, held on a
    ///  single connection for the life of the pool.
    pub async fn connect(url: &Url) -> Result<Self, DatabaseSetupError> {
        let in_memory = url.as_str().contains(":memory:");
        let options = SqliteConnectOptions::from_str(url.as_str())
            .map_err(|_| DatabaseSetupError::InvalidUrl(url.to_string()))?
            .create_if_missing(true);

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let db = Self(pool);
        db.run_migrations().await?;
        tracing::info!(url = %url, "database initialized");
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self, DatabaseSetupError> {
        let url = Url::parse("sqlite::memory:")
            .map_err(|_| DatabaseSetupError::InvalidUrl("sqlite::memory:".to_string()))?;
        Self::connect(&url).await
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_nodes (
                key TEXT PRIMARY KEY,
                prefix TEXT NOT NULL,
                value TEXT NOT NULL,
                modified_index INTEGER NOT NULL
            )
            "#,
        )
        .execute(&**self)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_kv_nodes_prefix ON kv_nodes(prefix)
            "#,
        )
        .execute(&**self)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_index (
                prefix TEXT NOT NULL,
                name TEXT NOT NULL,
                id TEXT NOT NULL,
                PRIMARY KEY (prefix, name)
            )
            "#,
        )
        .execute(&**self)
        .await?;

        // store-wide revision counter
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&**self)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO kv_meta (name, value) VALUES ('revision', 0)")
            .execute(&**self)
            .await?;

        Ok(())
    }
}
