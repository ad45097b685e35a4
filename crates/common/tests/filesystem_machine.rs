//! Integration tests for a single node's filesystem machines
//!
//! Tests cover serial handling, content save/read, failure recovery and
//! deletion.

mod common;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use ::common::fsm::{
    Event, EventName, LocalEngine, Snapshot, SnapshotEngine, StorageError,
};
use ::common::types::{FilesystemId, DEFAULT_SUBVOLUME};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, ReadBuf};

/// Body that yields a few bytes and then breaks
struct BrokenStream {
    sent: bool,
}

impl AsyncRead for BrokenStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(std::io::Error::other("stream broke")));
        }
        self.sent = true;
        buf.put_slice(b"partial content that never finishes");
        Poll::Ready(Ok(()))
    }
}

/// Local storage whose snapshots fail while `fail` is set
#[derive(Debug)]
struct FailingSnapshots {
    inner: LocalEngine,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl SnapshotEngine for FailingSnapshots {
    fn mount_path(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.inner.mount_path(filesystem_id)
    }

    fn snapshot_path(&self, filesystem_id: &FilesystemId, snapshot_id: &str) -> PathBuf {
        self.inner.snapshot_path(filesystem_id, snapshot_id)
    }

    async fn filesystem_exists(&self, filesystem_id: &FilesystemId) -> bool {
        self.inner.filesystem_exists(filesystem_id).await
    }

    async fn create_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError> {
        self.inner.create_filesystem(filesystem_id).await
    }

    async fn snapshot(
        &self,
        filesystem_id: &FilesystemId,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("no space left")));
        }
        self.inner.snapshot(filesystem_id, snapshot).await
    }

    async fn list_snapshots(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<Vec<Snapshot>, StorageError> {
        self.inner.list_snapshots(filesystem_id).await
    }

    async fn clone_snapshot(
        &self,
        origin: &FilesystemId,
        snapshot_id: &str,
        new_filesystem: &FilesystemId,
    ) -> Result<(), StorageError> {
        self.inner
            .clone_snapshot(origin, snapshot_id, new_filesystem)
            .await
    }

    async fn delete_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError> {
        self.inner.delete_filesystem(filesystem_id).await
    }
}

#[tokio::test]
async fn test_events_are_handled_in_send_order() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "ordered").await;

    let mut replies = Vec::new();
    for i in 0..10 {
        let (event, rx) = Event::request(EventName::Snapshot);
        let event = event.with_arg("metadata", json!({ "message": format!("snap {}", i) }));
        sender.send(event).unwrap();
        replies.push(rx);
    }
    let mut ids = Vec::new();
    for rx in replies {
        let reply = rx.await.unwrap();
        assert!(reply.is(EventName::Snapshotted), "unexpected {:?}", reply);
        ids.push(reply.arg_str("snapshot_id").unwrap().to_string());
    }

    assert_eq!(common::snapshot_ids(&sender).await, ids);
}

#[tokio::test]
async fn test_save_then_read_exact_bytes() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "content").await;

    let reply = common::save(&sender, "dir/hello.txt", b"hello world").await;
    assert!(reply.is(EventName::SaveSuccess), "unexpected {:?}", reply);
    assert_eq!(reply.args["bytes"], json!(11));

    let (reply, bytes) = common::read(&sender, "dir/hello.txt", None).await;
    assert!(reply.is(EventName::ReadSuccess), "unexpected {:?}", reply);
    assert_eq!(bytes, b"hello world");
}

#[tokio::test]
async fn test_save_retry_overwrites() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "retry").await;

    let first = common::save(&sender, "a.txt", b"first attempt").await;
    let second = common::save(&sender, "a.txt", b"second").await;
    assert!(first.is(EventName::SaveSuccess));
    assert!(second.is(EventName::SaveSuccess));

    let (_, bytes) = common::read(&sender, "a.txt", None).await;
    assert_eq!(bytes, b"second");

    // earlier content is still reachable through its snapshot
    let first_snapshot = first.arg_str("snapshot_id").unwrap();
    let (reply, bytes) = common::read(&sender, "a.txt", Some(first_snapshot)).await;
    assert!(reply.is(EventName::ReadSuccess));
    assert_eq!(bytes, b"first attempt");

    assert_eq!(common::snapshot_ids(&sender).await.len(), 2);
}

#[tokio::test]
async fn test_broken_upload_backs_off_then_retry_overwrites() {
    let node = common::setup_node("node-a");
    let (id, sender) = common::procure(&node, "broken").await;
    let states = common::watch_states(&node, &id);

    let reply = common::save_stream(&sender, "a.txt", BrokenStream { sent: false }).await;
    assert!(reply.is(EventName::SaveFailed), "unexpected {:?}", reply);
    assert!(reply.err().unwrap().contains("stream broke"));
    assert!(common::saw_transition(&states, "backoff").await);

    // same name again: the partial file is simply overwritten
    let reply = common::save(&sender, "a.txt", b"ok").await;
    assert!(reply.is(EventName::SaveSuccess), "unexpected {:?}", reply);
    assert!(common::saw_transition(&states, "active").await);

    let (reply, bytes) = common::read(&sender, "a.txt", None).await;
    assert!(reply.is(EventName::ReadSuccess));
    assert_eq!(bytes, b"ok");
    // the failed attempt committed nothing
    assert_eq!(common::snapshot_ids(&sender).await.len(), 1);
}

#[tokio::test]
async fn test_snapshot_failure_fails_the_save() {
    let fail = Arc::new(AtomicBool::new(true));
    let node = common::setup_node_with_engine("node-a", {
        let fail = fail.clone();
        move |inner| FailingSnapshots { inner, fail }
    });
    let (id, sender) = common::procure(&node, "unsnappable").await;
    let states = common::watch_states(&node, &id);

    let reply = common::save(&sender, "a.txt", b"written but not committed").await;
    assert!(reply.is(EventName::SaveFailed), "unexpected {:?}", reply);
    assert!(common::saw_transition(&states, "backoff").await);

    fail.store(false, Ordering::SeqCst);
    let reply = common::save(&sender, "a.txt", b"committed").await;
    assert!(reply.is(EventName::SaveSuccess), "unexpected {:?}", reply);

    let (_, bytes) = common::read(&sender, "a.txt", None).await;
    assert_eq!(bytes, b"committed");
    assert_eq!(common::snapshot_ids(&sender).await.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinks_cannot_reach_outside_the_dot() {
    let node = common::setup_node("node-a");
    let (id, sender) = common::procure(&node, "linked").await;

    let host = tempfile::TempDir::new().unwrap();
    std::fs::write(host.path().join("secret.txt"), b"HOST SECRET").unwrap();
    let subvolume = node
        .registry
        .context()
        .engine
        .mount_path(&id)
        .join(DEFAULT_SUBVOLUME);
    std::os::unix::fs::symlink(host.path(), subvolume.join("link")).unwrap();

    let (reply, bytes) = common::read(&sender, "link/secret.txt", None).await;
    assert!(reply.is(EventName::ReadFailed), "unexpected {:?}", reply);
    assert!(bytes.is_empty());

    let reply = common::save(&sender, "link/planted.txt", b"x").await;
    assert!(reply.is(EventName::SaveFailed), "unexpected {:?}", reply);
    assert!(!host.path().join("planted.txt").exists());

    // archiving the root keeps the link as a link
    let (reply, bytes) = common::read(&sender, "", None).await;
    assert!(reply.is(EventName::ReadSuccess), "unexpected {:?}", reply);
    let mut archive = tokio_tar::Archive::new(std::io::Cursor::new(bytes));
    let entries = archive.entries().unwrap();
    tokio::pin!(entries);
    let mut saw_link = false;
    while let Some(entry) = entries.next().await {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        assert!(!path.contains("secret"), "archived {}", path);
        if path.trim_end_matches('/').ends_with("link") {
            assert!(entry.header().entry_type().is_symlink());
            saw_link = true;
        }
    }
    assert!(saw_link);

    // the machine keeps serving
    let reply = common::save(&sender, "inside.txt", b"x").await;
    assert!(reply.is(EventName::SaveSuccess));
}

#[tokio::test]
async fn test_read_missing_file() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "missing").await;

    let (reply, bytes) = common::read(&sender, "nope.txt", None).await;
    assert!(reply.is(EventName::FileNotFound), "unexpected {:?}", reply);
    assert!(reply.err().is_some());
    assert!(bytes.is_empty());

    let (reply, _) = common::read(&sender, "a.txt", Some("no-such-snapshot")).await;
    assert!(reply.is(EventName::FileNotFound));
}

#[tokio::test]
async fn test_read_directory_streams_archive() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "archive").await;
    common::save(&sender, "data/one.csv", b"1,2,3").await;

    let (reply, bytes) = common::read(&sender, "data", None).await;
    assert!(reply.is(EventName::ReadSuccess), "unexpected {:?}", reply);
    assert_eq!(reply.args["archive"], json!(true));

    let mut archive = tokio_tar::Archive::new(std::io::Cursor::new(bytes));
    let unpacked = tempfile::TempDir::new().unwrap();
    archive.unpack(unpacked.path()).await.unwrap();
    let content = std::fs::read(unpacked.path().join("one.csv")).unwrap();
    assert_eq!(content, b"1,2,3");
}

#[tokio::test]
async fn test_escaping_paths_are_rejected() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "escape").await;

    let reply = common::save(&sender, "../../outside.txt", b"x").await;
    assert!(reply.is(EventName::SaveFailed), "unexpected {:?}", reply);
    let (reply, _) = common::read(&sender, "/etc/passwd", None).await;
    assert!(reply.is(EventName::ReadFailed), "unexpected {:?}", reply);

    // the machine is still active
    let reply = common::save(&sender, "inside.txt", b"x").await;
    assert!(reply.is(EventName::SaveSuccess));
}

#[tokio::test]
async fn test_unknown_event_is_unhandled() {
    let node = common::setup_node("node-a");
    let (_id, sender) = common::procure(&node, "unhandled").await;

    let reply = common::request(&sender, Event::new(EventName::Snapshotted)).await;
    assert!(reply.is(EventName::Unhandled));
    assert_eq!(reply.arg_str("state"), Some("active"));
}

#[tokio::test]
async fn test_delete_answers_later_messages() {
    let node = common::setup_node("node-a");
    let (id, sender) = common::procure(&node, "doomed").await;
    common::save(&sender, "a.txt", b"x").await;

    let (delete, delete_rx) = Event::request(EventName::Delete);
    let (after, after_rx) = Event::request(EventName::ListSnapshots);
    sender.send(delete).unwrap();
    sender.send(after).unwrap();

    assert!(delete_rx.await.unwrap().is(EventName::Deleted));
    let after = after_rx.await.unwrap();
    assert!(after.is(EventName::Error));

    assert!(common::eventually(|| async { node.registry.get(&id).is_none() }).await);
}
