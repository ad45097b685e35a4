//! Shared setup for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ::common::auth::RequestContext;
use ::common::fsm::{
    filesystem_topic, Event, EventName, FsRegistry, InputFile, LocalEngine, MachineContext,
    MessageSender, Notification, OutputFile, SnapshotEngine,
};
use ::common::kv::MemoryKv;
use ::common::master::MasterStore;
use ::common::observer::Observer;
use ::common::types::{FilesystemId, NodeId, VolumeName};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

/// One node of a simulated cluster
pub struct TestNode {
    pub registry: FsRegistry<MemoryKv>,
    pub node_id: NodeId,
    // held so the data dir outlives the node
    pub dir: TempDir,
}

/// A single node with its own store
pub fn setup_node(node_id: &str) -> TestNode {
    setup_cluster_node(node_id, MemoryKv::new(), Observer::new(node_id))
}

/// A node sharing `kv` and `observer` with the rest of a cluster
pub fn setup_cluster_node(
    node_id: &str,
    kv: MemoryKv,
    observer: Observer<Notification>,
) -> TestNode {
    build_node(node_id, kv, observer, |local| -> Arc<dyn SnapshotEngine> {
        Arc::new(local)
    })
}

/// A single node whose storage is `wrap` applied to a local engine
pub fn setup_node_with_engine<E, F>(node_id: &str, wrap: F) -> TestNode
where
    E: SnapshotEngine,
    F: FnOnce(LocalEngine) -> E,
{
    build_node(
        node_id,
        MemoryKv::new(),
        Observer::new(node_id),
        |local| -> Arc<dyn SnapshotEngine> { Arc::new(wrap(local)) },
    )
}

fn build_node(
    node_id: &str,
    kv: MemoryKv,
    observer: Observer<Notification>,
    engine: impl FnOnce(LocalEngine) -> Arc<dyn SnapshotEngine>,
) -> TestNode {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let ctx = MachineContext {
        engine: engine(LocalEngine::new(dir.path())),
        masters: MasterStore::new(kv),
        observer,
        node_id: NodeId::from(node_id),
        backoff: Duration::from_millis(20),
    };
    TestNode {
        registry: FsRegistry::new(ctx),
        node_id: NodeId::from(node_id),
        dir,
    }
}

/// Procure a fresh filesystem on `node` and return its id and sender
pub async fn procure(node: &TestNode, name: &str) -> (FilesystemId, MessageSender) {
    let id = node
        .registry
        .procure(&RequestContext::admin(), &VolumeName::new("admin", name))
        .await
        .expect("procure");
    let sender = node.registry.get_or_spawn(&id);
    (id, sender)
}

pub async fn save(sender: &MessageSender, filename: &str, contents: &[u8]) -> Event {
    let (file, rx) = InputFile::new(filename, std::io::Cursor::new(contents.to_vec()), "tester");
    sender.save_file(file, rx).await.expect("machine running")
}

/// Read `filename` (at `snapshot_id` when given), returning the reply and
///  every byte written to the output
pub async fn read(
    sender: &MessageSender,
    filename: &str,
    snapshot_id: Option<&str>,
) -> (Event, Vec<u8>) {
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let collect = tokio::spawn(async move {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.map(|_| out)
    });

    let (mut file, rx) = OutputFile::new(filename, writer);
    if let Some(snapshot_id) = snapshot_id {
        file = file.at_snapshot(snapshot_id);
    }
    let reply = sender.read_file(file, rx).await.expect("machine running");
    let bytes = collect.await.unwrap().unwrap_or_default();
    (reply, bytes)
}

/// Save with a caller supplied body stream
pub async fn save_stream(
    sender: &MessageSender,
    filename: &str,
    contents: impl tokio::io::AsyncRead + Send + Unpin + 'static,
) -> Event {
    let (file, rx) = InputFile::new(filename, contents, "tester");
    sender.save_file(file, rx).await.expect("machine running")
}

/// Subscribe to `id`'s state transitions
pub fn watch_states(node: &TestNode, id: &FilesystemId) -> flume::Receiver<Notification> {
    let (_, rx) = node
        .registry
        .context()
        .observer
        .subscribe_channel(&filesystem_topic(id));
    rx
}

/// Wait until `states` reports a transition into `to`
pub async fn saw_transition(states: &flume::Receiver<Notification>, to: &str) -> bool {
    let wait = async {
        while let Ok(notification) = states.recv_async().await {
            if let Notification::StateChanged { to: reached, .. } = notification {
                if reached == to {
                    return true;
                }
            }
        }
        false
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or(false)
}

pub async fn request(sender: &MessageSender, event: Event) -> Event {
    sender.request(event).await.expect("machine running")
}

pub async fn snapshot_ids(sender: &MessageSender) -> Vec<String> {
    let reply = request(sender, Event::new(EventName::ListSnapshots)).await;
    assert!(reply.is(EventName::Snapshots), "unexpected reply {:?}", reply);
    reply.args["snapshots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect()
}

/// Retry `check` until it holds or a second has passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
