use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::kv::{KvError, KvProvider};
use crate::types::{FilesystemId, NodeId};

/// Prefix under which master records are kept in the store
pub const MASTERS_PREFIX: &str = "filesystems/masters";

/// Which node currently owns write-mastership of a filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemMaster {
    pub filesystem_id: FilesystemId,
    pub node_id: NodeId,
}

impl FilesystemMaster {
    pub fn new(filesystem_id: FilesystemId, node_id: NodeId) -> Self {
        Self {
            filesystem_id,
            node_id,
        }
    }
}

/// Precondition on the existing record for [`MasterStore::set_master`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    /// Create or overwrite
    #[default]
    Any,
    /// Only create; an existing record is a conflict
    MustNotExist,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub prev_exist: PrevExist,
}

impl SetOptions {
    pub fn create_only() -> Self {
        Self {
            prev_exist: PrevExist::MustNotExist,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MasterStoreError {
    #[error("no master recorded for filesystem {0}")]
    NotFound(FilesystemId),
    /// The stored owner was not the one the caller expected. `current` is
    ///  the owner observed right after the failed write, if it could be read.
    #[error("master of filesystem {filesystem_id} changed concurrently (now {current:?})")]
    Conflict {
        filesystem_id: FilesystemId,
        current: Option<NodeId>,
    },
    #[error("failed to encode master record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("kv provider error: {0}")]
    Provider(String),
}

/// Typed view over master records held in a [`KvProvider`].
#[derive(Debug, Clone)]
pub struct MasterStore<K: KvProvider> {
    kv: K,
}

impl<K: KvProvider> MasterStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Read the current owner of a filesystem
    pub async fn get_master(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<FilesystemMaster, MasterStoreError> {
        let node = self
            .kv
            .get_by_id(MASTERS_PREFIX, filesystem_id.as_str())
            .await
            .map_err(|e| map_kv_error(filesystem_id, e))?;
        Ok(serde_json::from_str(&node.value)?)
    }

    /// Unconditionally record an owner. Meant for initial assignment only;
    ///  changes of ownership go through [`Self::update_master_if_matches`].
    pub async fn set_master(
        &self,
        record: &FilesystemMaster,
        options: &SetOptions,
    ) -> Result<(), MasterStoreError> {
        let value = serde_json::to_string(record)?;
        let id = record.filesystem_id.as_str();
        let result = match options.prev_exist {
            PrevExist::Any => self.kv.set(MASTERS_PREFIX, id, value).await,
            PrevExist::MustNotExist => self.kv.create(MASTERS_PREFIX, id, value).await,
        };
        match result {
            Ok(_) => Ok(()),
            Err(KvError::AlreadyExists(_)) => Err(MasterStoreError::Conflict {
                filesystem_id: record.filesystem_id.clone(),
                current: self.current_owner(&record.filesystem_id).await,
            }),
            Err(e) => Err(map_kv_error(&record.filesystem_id, e)),
        }
    }

    /// Move mastership to `new_node` only if `expected_old` still owns it.
    ///
    /// On a mismatch nothing is written and `Conflict` reports the owner
    ///  observed afterwards. The store never retries on the caller's behalf.
    pub async fn update_master_if_matches(
        &self,
        filesystem_id: &FilesystemId,
        new_node: &NodeId,
        expected_old: &NodeId,
    ) -> Result<FilesystemMaster, MasterStoreError> {
        let expected = serde_json::to_string(&FilesystemMaster::new(
            filesystem_id.clone(),
            expected_old.clone(),
        ))?;
        let updated = FilesystemMaster::new(filesystem_id.clone(), new_node.clone());
        let value = serde_json::to_string(&updated)?;

        match self
            .kv
            .compare_and_swap(MASTERS_PREFIX, filesystem_id.as_str(), &expected, value)
            .await
        {
            Ok(_) => Ok(updated),
            Err(KvError::Conflict(_)) => Err(MasterStoreError::Conflict {
                filesystem_id: filesystem_id.clone(),
                current: self.current_owner(filesystem_id).await,
            }),
            Err(e) => Err(map_kv_error(filesystem_id, e)),
        }
    }

    /// Remove the record once the filesystem itself is gone
    pub async fn delete_master(&self, filesystem_id: &FilesystemId) -> Result<(), MasterStoreError> {
        self.kv
            .delete(MASTERS_PREFIX, filesystem_id.as_str())
            .await
            .map_err(|e| map_kv_error(filesystem_id, e))
    }

    /// All master records currently held
    pub async fn list_masters(&self) -> Result<Vec<FilesystemMaster>, MasterStoreError> {
        let nodes = self
            .kv
            .list(MASTERS_PREFIX)
            .await
            .map_err(|e| MasterStoreError::Provider(e.to_string()))?;
        let mut masters = Vec::with_capacity(nodes.len());
        for node in nodes {
            match serde_json::from_str(&node.value) {
                Ok(master) => masters.push(master),
                Err(e) => tracing::warn!(key = %node.key, error = %e, "skipping malformed master record"),
            }
        }
        Ok(masters)
    }

    async fn current_owner(&self, filesystem_id: &FilesystemId) -> Option<NodeId> {
        self.get_master(filesystem_id)
            .await
            .ok()
            .map(|master| master.node_id)
    }
}

fn map_kv_error<E: Display>(filesystem_id: &FilesystemId, err: KvError<E>) -> MasterStoreError {
    match err {
        KvError::NotFound(_) => MasterStoreError::NotFound(filesystem_id.clone()),
        KvError::Conflict(_) | KvError::AlreadyExists(_) => MasterStoreError::Conflict {
            filesystem_id: filesystem_id.clone(),
            current: None,
        },
        KvError::Provider(e) => MasterStoreError::Provider(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> MasterStore<MemoryKv> {
        MasterStore::new(MemoryKv::new())
    }

    #[tokio::test]
    async fn test_get_missing_master() {
        let masters = store();
        let result = masters.get_master(&"fs-id".into()).await;
        assert!(matches!(result, Err(MasterStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_set_master_create_only() {
        let masters = store();
        let record = FilesystemMaster::new("fs-id".into(), "1".into());
        masters
            .set_master(&record, &SetOptions::create_only())
            .await
            .unwrap();

        let other = FilesystemMaster::new("fs-id".into(), "2".into());
        let result = masters.set_master(&other, &SetOptions::create_only()).await;
        match result {
            Err(MasterStoreError::Conflict { current, .. }) => {
                assert_eq!(current, Some(NodeId::from("1")))
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Unconditional set still overwrites
        masters.set_master(&other, &SetOptions::default()).await.unwrap();
        assert_eq!(
            masters.get_master(&"fs-id".into()).await.unwrap().node_id,
            NodeId::from("2")
        );
    }

    #[tokio::test]
    async fn test_update_missing_master() {
        let masters = store();
        let result = masters
            .update_master_if_matches(&"fs-id".into(), &"2".into(), &"1".into())
            .await;
        assert!(matches!(result, Err(MasterStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let masters = store();
        for (fs, node) in [("a", "1"), ("b", "2")] {
            masters
                .set_master(
                    &FilesystemMaster::new(fs.into(), node.into()),
                    &SetOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(masters.list_masters().await.unwrap().len(), 2);

        masters.delete_master(&"a".into()).await.unwrap();
        let remaining = masters.list_masters().await.unwrap();
        assert_eq!(remaining, vec![FilesystemMaster::new("b".into(), "2".into())]);

        assert!(matches!(
            masters.delete_master(&"a".into()).await,
            Err(MasterStoreError::NotFound(_))
        ));
    }
}
