//! The node's table of running filesystem machines.
//!
//! There is at most one live machine per filesystem id. Machines are spawned
//! on first use and torn down explicitly; a machine that stopped on its own
//! (after a delete) is replaced on the next use.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::event::{Event, EventName};
use super::machine::{FsMachine, MachineContext};
use super::queue::{MachineGone, MessageSender};
use super::snapshot::StorageError;
use super::Notification;
use crate::auth::RequestContext;
use crate::kv::{KvError, KvProvider};
use crate::master::{FilesystemMaster, MasterStoreError, SetOptions, MASTER_CHANGED_TOPIC};
use crate::types::{FilesystemId, NodeId, TopLevelFilesystem, VolumeName};

/// Prefix under which top-level filesystem records are kept, indexed by name
pub const FILESYSTEMS_PREFIX: &str = "filesystems/registry";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("filesystem {0} not found")]
    NotFound(String),
    #[error("registry store error: {0}")]
    Kv(String),
    #[error("malformed filesystem record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Master(#[from] MasterStoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    MachineGone(#[from] MachineGone),
    #[error("delete of filesystem {filesystem_id} failed: {reason}")]
    Delete {
        filesystem_id: FilesystemId,
        reason: String,
    },
}

#[derive(Debug)]
struct FsHandle {
    sender: MessageSender,
    task: JoinHandle<()>,
}

impl FsHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.sender.is_closed()
    }
}

#[derive(Debug)]
struct RegistryInner<K: KvProvider> {
    ctx: MachineContext<K>,
    machines: parking_lot::Mutex<HashMap<FilesystemId, FsHandle>>,
    /// Serializes name -> id allocation so two procures of one name agree
    procure_lock: tokio::sync::Mutex<()>,
}

/// Spawns, finds and tears down filesystem machines
#[derive(Debug)]
pub struct FsRegistry<K: KvProvider> {
    inner: Arc<RegistryInner<K>>,
}

impl<K: KvProvider> Clone for FsRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: KvProvider> FsRegistry<K> {
    pub fn new(ctx: MachineContext<K>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                machines: parking_lot::Mutex::new(HashMap::new()),
                procure_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn context(&self) -> &MachineContext<K> {
        &self.inner.ctx
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.ctx.node_id
    }

    /// Sender for the filesystem's machine, spawning one if none is running
    pub fn get_or_spawn(&self, filesystem_id: &FilesystemId) -> MessageSender {
        self.inner.get_or_spawn(filesystem_id)
    }

    /// Sender for the filesystem's machine, if one is running
    pub fn get(&self, filesystem_id: &FilesystemId) -> Option<MessageSender> {
        self.inner.get(filesystem_id)
    }

    /// Stop a machine without touching the filesystem it drives.
    ///
    /// Queued messages are dropped along with the task, and their waiting
    ///  requesters get `error` replies.
    pub fn teardown(&self, filesystem_id: &FilesystemId) -> bool {
        let handle = self.inner.machines.lock().remove(filesystem_id);
        match handle {
            Some(handle) => {
                handle.task.abort();
                tracing::info!(filesystem_id = %filesystem_id, "tore down filesystem machine");
                true
            }
            None => false,
        }
    }

    /// Ids with a running machine
    pub fn ids(&self) -> Vec<FilesystemId> {
        let machines = self.inner.machines.lock();
        let mut ids: Vec<_> = machines
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Id of the filesystem with this name, creating it (mastered here and
    ///  owned by the caller) if there is none yet. Either way its machine is
    ///  running afterwards.
    pub async fn procure(
        &self,
        ctx: &RequestContext,
        name: &VolumeName,
    ) -> Result<FilesystemId, RegistryError> {
        let _guard = self.inner.procure_lock.lock().await;

        if let Some(filesystem_id) = self.lookup(name).await? {
            self.get_or_spawn(&filesystem_id);
            return Ok(filesystem_id);
        }

        let filesystem_id = FilesystemId::generate();
        let record = TopLevelFilesystem {
            filesystem_id: filesystem_id.clone(),
            name: name.clone(),
            owner_id: ctx.user_id().to_string(),
        };
        let master = FilesystemMaster::new(filesystem_id.clone(), self.node_id().clone());
        self.inner
            .ctx
            .masters
            .set_master(&master, &SetOptions::create_only())
            .await?;

        if let Err(e) = self.register(&record).await {
            self.abandon(&filesystem_id).await;
            return Err(e);
        }

        tracing::info!(
            filesystem_id = %filesystem_id,
            name = %name,
            owner = %record.owner_id,
            "procured new filesystem"
        );
        self.get_or_spawn(&filesystem_id);
        Ok(filesystem_id)
    }

    /// Local storage and the registry record of a freshly mastered filesystem
    async fn register(&self, record: &TopLevelFilesystem) -> Result<(), RegistryError> {
        let filesystem_id = &record.filesystem_id;
        match self.inner.ctx.engine.create_filesystem(filesystem_id).await {
            Ok(()) | Err(StorageError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.kv()
            .create_with_index(
                FILESYSTEMS_PREFIX,
                filesystem_id.as_str(),
                &record.name.to_string(),
                serde_json::to_string(record)?,
            )
            .await
            .map_err(|e| RegistryError::Kv(e.to_string()))?;
        Ok(())
    }

    /// Drop what a failed procure left behind so the name starts clean
    async fn abandon(&self, filesystem_id: &FilesystemId) {
        if let Err(e) = self.inner.ctx.masters.delete_master(filesystem_id).await {
            tracing::warn!(
                filesystem_id = %filesystem_id,
                error = %e,
                "failed to drop master record of abandoned filesystem"
            );
        }
        match self.inner.ctx.engine.delete_filesystem(filesystem_id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(
                filesystem_id = %filesystem_id,
                error = %e,
                "failed to remove storage of abandoned filesystem"
            ),
        }
    }

    /// Resolve a name through the registry's index
    pub async fn lookup(&self, name: &VolumeName) -> Result<Option<FilesystemId>, RegistryError> {
        match self.kv().get(FILESYSTEMS_PREFIX, &name.to_string()).await {
            Ok(node) => {
                let record: TopLevelFilesystem = serde_json::from_str(&node.value)?;
                Ok(Some(record.filesystem_id))
            }
            Err(KvError::NotFound(_)) => Ok(None),
            Err(e) => Err(RegistryError::Kv(e.to_string())),
        }
    }

    /// The registry record of a filesystem
    pub async fn describe(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<TopLevelFilesystem, RegistryError> {
        match self
            .kv()
            .get_by_id(FILESYSTEMS_PREFIX, filesystem_id.as_str())
            .await
        {
            Ok(node) => Ok(serde_json::from_str(&node.value)?),
            Err(KvError::NotFound(_)) => Err(RegistryError::NotFound(filesystem_id.to_string())),
            Err(e) => Err(RegistryError::Kv(e.to_string())),
        }
    }

    /// Every registered filesystem, by name
    pub async fn filesystems(&self) -> Result<Vec<(VolumeName, FilesystemId)>, RegistryError> {
        let nodes = self
            .kv()
            .list(FILESYSTEMS_PREFIX)
            .await
            .map_err(|e| RegistryError::Kv(e.to_string()))?;
        let mut filesystems = Vec::with_capacity(nodes.len());
        for node in nodes {
            match serde_json::from_str::<TopLevelFilesystem>(&node.value) {
                Ok(record) => filesystems.push((record.name, record.filesystem_id)),
                Err(e) => {
                    tracing::warn!(key = %node.key, error = %e, "skipping malformed filesystem record")
                }
            }
        }
        Ok(filesystems)
    }

    /// Delete a filesystem everywhere: the machine drops its master record
    ///  and local copy, then the registry record and name go too.
    pub async fn remove(&self, filesystem_id: &FilesystemId) -> Result<(), RegistryError> {
        let record = self.describe(filesystem_id).await?;
        let reply = self
            .get_or_spawn(filesystem_id)
            .request(Event::new(EventName::Delete))
            .await?;
        if !reply.is(EventName::Deleted) {
            return Err(RegistryError::Delete {
                filesystem_id: filesystem_id.clone(),
                reason: reply
                    .err()
                    .map(str::to_string)
                    .unwrap_or_else(|| reply.name.to_string()),
            });
        }

        self.unregister(&record).await?;
        self.teardown(filesystem_id);
        Ok(())
    }

    async fn unregister(&self, record: &TopLevelFilesystem) -> Result<(), RegistryError> {
        match self
            .kv()
            .delete(FILESYSTEMS_PREFIX, record.filesystem_id.as_str())
            .await
        {
            Ok(()) | Err(KvError::NotFound(_)) => {}
            Err(e) => return Err(RegistryError::Kv(e.to_string())),
        }
        if let Err(e) = self
            .kv()
            .delete_from_index(FILESYSTEMS_PREFIX, &record.name.to_string())
            .await
        {
            tracing::warn!(
                filesystem_id = %record.filesystem_id,
                name = %record.name,
                error = %e,
                "failed to remove name from index"
            );
        }
        Ok(())
    }

    /// Forward `master-changed` notifications to the machines they concern.
    ///
    /// The forwarding task ends with the first notification that arrives
    ///  after every clone of the registry is gone.
    pub fn watch_masters(&self) -> JoinHandle<()> {
        let observer = self.inner.ctx.observer.clone();
        let (subscription, rx) = observer.subscribe_channel(MASTER_CHANGED_TOPIC);
        let registry = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Ok(notification) = rx.recv_async().await {
                let Some(inner) = Weak::upgrade(&registry) else {
                    break;
                };
                if let Notification::MasterChanged(changed) = notification {
                    inner.forward_master(&changed.filesystem_id, &changed.node_id);
                }
            }
            observer.unsubscribe(MASTER_CHANGED_TOPIC, subscription);
            tracing::debug!("master watch stopped");
        })
    }

    /// Periodically reconcile running machines with the master records, for
    ///  changes made by other nodes. Filesystems mastered here get a machine
    ///  even if nothing asked for one yet.
    pub fn poll_masters(&self, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut known: HashMap<FilesystemId, NodeId> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = Weak::upgrade(&registry) else {
                    break;
                };
                let masters = match inner.ctx.masters.list_masters().await {
                    Ok(masters) => masters,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to poll master records");
                        continue;
                    }
                };
                for master in masters {
                    let changed = known.get(&master.filesystem_id) != Some(&master.node_id);
                    if master.node_id == inner.ctx.node_id {
                        inner.get_or_spawn(&master.filesystem_id);
                    }
                    if changed {
                        inner.forward_master(&master.filesystem_id, &master.node_id);
                        known.insert(master.filesystem_id, master.node_id);
                    }
                }
            }
        })
    }

    /// Stop every machine
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.inner.machines.lock().drain().collect();
        for (filesystem_id, handle) in handles {
            handle.task.abort();
            tracing::debug!(filesystem_id = %filesystem_id, "stopped filesystem machine");
        }
    }

    fn kv(&self) -> &K {
        self.inner.ctx.masters.kv()
    }
}

impl<K: KvProvider> RegistryInner<K> {
    fn get_or_spawn(&self, filesystem_id: &FilesystemId) -> MessageSender {
        let mut machines = self.machines.lock();
        if let Some(handle) = machines.get(filesystem_id) {
            if handle.is_live() {
                return handle.sender.clone();
            }
        }

        let (sender, task) = FsMachine::spawn(filesystem_id.clone(), self.ctx.clone());
        tracing::info!(filesystem_id = %filesystem_id, "spawned filesystem machine");
        machines.insert(
            filesystem_id.clone(),
            FsHandle {
                sender: sender.clone(),
                task,
            },
        );
        sender
    }

    fn get(&self, filesystem_id: &FilesystemId) -> Option<MessageSender> {
        self.machines
            .lock()
            .get(filesystem_id)
            .filter(|handle| handle.is_live())
            .map(|handle| handle.sender.clone())
    }

    /// Tell a running machine about its filesystem's new master. A machine
    ///  that is not running picks the master up when it next discovers.
    fn forward_master(&self, filesystem_id: &FilesystemId, node_id: &NodeId) {
        let Some(sender) = self.get(filesystem_id) else {
            return;
        };
        let event = Event::new(EventName::MasterChanged).with_arg("node_id", node_id.to_string());
        if sender.send(event).is_err() {
            tracing::debug!(filesystem_id = %filesystem_id, "machine stopped before master change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::LocalEngine;
    use crate::kv::{KvNode, MemoryKv};
    use crate::master::MasterStore;
    use crate::observer::Observer;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> FsRegistry<MemoryKv> {
        FsRegistry::new(MachineContext {
            engine: Arc::new(LocalEngine::new(dir.path())),
            masters: MasterStore::new(MemoryKv::new()),
            observer: Observer::new("test"),
            node_id: NodeId::from("node-a"),
            backoff: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_procure_is_idempotent_by_name() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let ctx = RequestContext::admin();
        let name = VolumeName::new("admin", "data");

        let first = registry.procure(&ctx, &name).await.unwrap();
        let second = registry.procure(&ctx, &name).await.unwrap();
        assert_eq!(first, second);

        let master = registry.context().masters.get_master(&first).await.unwrap();
        assert_eq!(master.node_id, NodeId::from("node-a"));

        let listed = registry.filesystems().await.unwrap();
        assert_eq!(listed, vec![(name, first.clone())]);
        assert_eq!(registry.ids(), vec![first]);
    }

    #[tokio::test]
    async fn test_get_or_spawn_reuses_running_machine() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let id = FilesystemId::from("fs-1");

        let a = registry.get_or_spawn(&id);
        let b = registry.get_or_spawn(&id);
        assert_eq!(registry.ids().len(), 1);
        assert!(!a.is_closed() && !b.is_closed());

        assert!(registry.teardown(&id));
        assert!(registry.get(&id).is_none());
        assert!(!registry.teardown(&id));
    }

    #[tokio::test]
    async fn test_lookup_unknown_name() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let found = registry
            .lookup(&VolumeName::new("admin", "missing"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    /// Store whose registry writes fail while `fail` is set
    #[derive(Debug, Clone, Default)]
    struct RefusingKv {
        inner: MemoryKv,
        fail: Arc<std::sync::atomic::AtomicBool>,
    }

    fn lift<T>(result: Result<T, KvError<std::convert::Infallible>>) -> Result<T, KvError<String>> {
        result.map_err(|e| match e {
            KvError::Provider(never) => match never {},
            KvError::NotFound(key) => KvError::NotFound(key),
            KvError::Conflict(key) => KvError::Conflict(key),
            KvError::AlreadyExists(key) => KvError::AlreadyExists(key),
        })
    }

    #[async_trait::async_trait]
    impl KvProvider for RefusingKv {
        type Error = String;

        async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<String>> {
            lift(self.inner.get_by_id(prefix, id).await)
        }

        async fn set(
            &self,
            prefix: &str,
            id: &str,
            value: String,
        ) -> Result<KvNode, KvError<String>> {
            if prefix == FILESYSTEMS_PREFIX
                && self.fail.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(KvError::Provider("store unavailable".to_string()));
            }
            lift(self.inner.set(prefix, id, value).await)
        }

        async fn create(
            &self,
            prefix: &str,
            id: &str,
            value: String,
        ) -> Result<KvNode, KvError<String>> {
            lift(self.inner.create(prefix, id, value).await)
        }

        async fn compare_and_swap(
            &self,
            prefix: &str,
            id: &str,
            expected: &str,
            value: String,
        ) -> Result<KvNode, KvError<String>> {
            lift(self.inner.compare_and_swap(prefix, id, expected, value).await)
        }

        async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<String>> {
            lift(self.inner.delete(prefix, id).await)
        }

        async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<String>> {
            lift(self.inner.list(prefix).await)
        }

        async fn add_to_index(
            &self,
            prefix: &str,
            name: &str,
            id: &str,
        ) -> Result<(), KvError<String>> {
            lift(self.inner.add_to_index(prefix, name, id).await)
        }

        async fn delete_from_index(&self, prefix: &str, name: &str) -> Result<(), KvError<String>> {
            lift(self.inner.delete_from_index(prefix, name).await)
        }

        async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<String>> {
            lift(self.inner.find_id(prefix, name).await)
        }
    }

    #[tokio::test]
    async fn test_failed_procure_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let kv = RefusingKv::default();
        let registry = FsRegistry::new(MachineContext {
            engine: Arc::new(LocalEngine::new(dir.path())),
            masters: MasterStore::new(kv.clone()),
            observer: Observer::new("test"),
            node_id: NodeId::from("node-a"),
            backoff: Duration::from_millis(10),
        });
        let ctx = RequestContext::admin();
        let name = VolumeName::new("admin", "flaky");

        kv.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            registry.procure(&ctx, &name).await,
            Err(RegistryError::Kv(_))
        ));
        assert!(registry.context().masters.list_masters().await.unwrap().is_empty());
        let leftover = std::fs::read_dir(dir.path().join("mnt"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
        assert!(registry.ids().is_empty());

        kv.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        let id = registry.procure(&ctx, &name).await.unwrap();
        let masters = registry.context().masters.list_masters().await.unwrap();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].filesystem_id, id);
    }

    #[tokio::test]
    async fn test_remove_drops_every_record() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let name = VolumeName::new("admin", "gone");
        let id = registry
            .procure(&RequestContext::admin(), &name)
            .await
            .unwrap();

        registry.remove(&id).await.unwrap();

        assert!(registry.lookup(&name).await.unwrap().is_none());
        assert!(matches!(
            registry.context().masters.get_master(&id).await,
            Err(MasterStoreError::NotFound(_))
        ));
        assert!(!registry.context().engine.filesystem_exists(&id).await);
    }
}
