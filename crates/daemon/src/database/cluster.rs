use async_trait::async_trait;

use common::kv::{KvError, KvNode, KvProvider};

#[cfg(feature = "etcd")]
use super::EtcdKv;
use super::SqliteKv;

/// The cluster store a node was configured with
#[derive(Debug, Clone)]
pub enum ClusterKv {
    /// Node-local; only meaningful for a single node
    Sqlite(SqliteKv),
    /// Shared by every node pointed at the same etcd cluster
    #[cfg(feature = "etcd")]
    Etcd(EtcdKv),
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterKvError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[cfg(feature = "etcd")]
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
}

fn widen<E: Into<ClusterKvError>>(e: KvError<E>) -> KvError<ClusterKvError> {
    match e {
        KvError::Provider(e) => KvError::Provider(e.into()),
        KvError::NotFound(key) => KvError::NotFound(key),
        KvError::Conflict(key) => KvError::Conflict(key),
        KvError::AlreadyExists(key) => KvError::AlreadyExists(key),
    }
}

macro_rules! dispatch {
    ($self:ident, $kv:ident => $call:expr) => {
        match $self {
            ClusterKv::Sqlite($kv) => $call.await.map_err(widen),
            #[cfg(feature = "etcd")]
            ClusterKv::Etcd($kv) => $call.await.map_err(widen),
        }
    };
}

#[async_trait]
impl KvProvider for ClusterKv {
    type Error = ClusterKvError;

    async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<Self::Error>> {
        dispatch!(self, kv => kv.get_by_id(prefix, id))
    }

    async fn set(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        dispatch!(self, kv => kv.set(prefix, id, value))
    }

    async fn create(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        dispatch!(self, kv => kv.create(prefix, id, value))
    }

    async fn compare_and_swap(
        &self,
        prefix: &str,
        id: &str,
        expected: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        dispatch!(self, kv => kv.compare_and_swap(prefix, id, expected, value))
    }

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<Self::Error>> {
        dispatch!(self, kv => kv.delete(prefix, id))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<Self::Error>> {
        dispatch!(self, kv => kv.list(prefix))
    }

    async fn add_to_index(
        &self,
        prefix: &str,
        name: &str,
        id: &str,
    ) -> Result<(), KvError<Self::Error>> {
        dispatch!(self, kv => kv.add_to_index(prefix, name, id))
    }

    async fn delete_from_index(
        &self,
        prefix: &str,
        name: &str,
    ) -> Result<(), KvError<Self::Error>> {
        dispatch!(self, kv => kv.delete_from_index(prefix, name))
    }

    async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<Self::Error>> {
        dispatch!(self, kv => kv.find_id(prefix, name))
    }
}
