//! Replication, branching, handoff and deletion steps of a machine.

use std::io::Cursor;

use bytes::Bytes;
use serde_json::Value;

use super::event::{Event, EventName};
use super::machine::{snapshot_json, FsMachine};
use super::snapshot::{Snapshot, StorageError};
use super::state::State;
use crate::kv::KvProvider;
use crate::master::{
    FilesystemMaster, Handoff, HandoffError, MasterStoreError, RetryPolicy, SetOptions,
};
use crate::types::{FilesystemId, NodeId};

impl<K: KvProvider> FsMachine<K> {
    /// Branch a new filesystem off one of this filesystem's snapshots.
    ///
    /// Args: `snapshot_id` (defaults to the latest), `filesystem_id` for the
    ///  branch (generated when absent). The branch is mastered here.
    pub(super) async fn clone_filesystem(&mut self, event: Event) -> State {
        let snapshot_id = match event.arg_str("snapshot_id").or(self.tail_id()) {
            Some(id) => id.to_string(),
            None => {
                event.respond(Event::error(EventName::Error, "filesystem has no snapshots"));
                return State::Active;
            }
        };
        let branch = event
            .arg_str("filesystem_id")
            .map(FilesystemId::from)
            .unwrap_or_else(FilesystemId::generate);

        match self
            .ctx
            .engine
            .clone_snapshot(&self.filesystem_id, &snapshot_id, &branch)
            .await
        {
            Ok(()) => {}
            Err(e @ (StorageError::SnapshotNotFound { .. } | StorageError::AlreadyExists(_))) => {
                event.respond(Event::error(EventName::Error, e));
                return State::Active;
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    snapshot_id = %snapshot_id,
                    error = %e,
                    "failed to clone"
                );
                event.respond(Event::error(EventName::Error, e));
                return self.backoff();
            }
        }

        let master = FilesystemMaster::new(branch.clone(), self.ctx.node_id.clone());
        if let Err(e) = self
            .ctx
            .masters
            .set_master(&master, &SetOptions::create_only())
            .await
        {
            tracing::error!(
                filesystem_id = %branch,
                error = %e,
                "failed to record master of clone"
            );
            event.respond(Event::error(EventName::Error, e));
            return self.backoff();
        }

        tracing::info!(
            filesystem_id = %self.filesystem_id,
            snapshot_id = %snapshot_id,
            clone = %branch,
            "cloned filesystem"
        );
        event.respond(
            Event::new(EventName::Cloned)
                .with_arg("filesystem_id", branch.to_string())
                .with_arg("snapshot_id", snapshot_id),
        );
        State::Active
    }

    /// Export the snapshots after `since` (all of them when absent) together
    ///  with an archive of the latest one's content.
    pub(super) async fn push(&mut self, event: Event, resume: State) -> State {
        let since = event.arg_str("since").map(str::to_string);
        let start = match since.as_deref() {
            Some(since) => match self.history.iter().position(|s| s.id == since) {
                Some(index) => index + 1,
                None => {
                    event.respond(Event::error(
                        EventName::Error,
                        format!("unknown snapshot {}", since),
                    ));
                    return resume;
                }
            },
            None => 0,
        };
        let newer: Vec<Value> = self.history[start..].iter().map(snapshot_json).collect();

        let mut reply = Event::new(EventName::Pushed)
            .with_arg("snapshots", newer)
            .with_arg("tail", self.tail_id().map(Value::from).unwrap_or(Value::Null));

        if let Some(tail) = self.history.last() {
            let path = self.ctx.engine.snapshot_path(&self.filesystem_id, &tail.id);
            match archive_dir(&path).await {
                Ok(archive) => reply = reply.with_payload(archive),
                Err(e) => {
                    tracing::error!(
                        filesystem_id = %self.filesystem_id,
                        snapshot_id = %tail.id,
                        error = %e,
                        "failed to archive snapshot for push"
                    );
                    event.respond(Event::error(EventName::Error, e));
                    return self.backoff();
                }
            }
        }

        event.respond(reply);
        resume
    }

    /// Apply one replicated snapshot. It must extend the current tail:
    ///  `parent` names the snapshot it follows, absent for the first one.
    pub(super) async fn receive_snapshot(&mut self, mut event: Event) -> State {
        let snapshot: Snapshot = match event
            .args
            .get("snapshot")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                event.respond(Event::error(EventName::Error, format!("bad snapshot: {}", e)));
                return State::Receiving;
            }
            None => {
                event.respond(Event::error(EventName::Error, "missing snapshot"));
                return State::Receiving;
            }
        };
        let parent = event.arg_str("parent").map(str::to_string);
        if parent.as_deref() != self.tail_id() {
            let reply = Event::error(
                EventName::Error,
                format!(
                    "snapshot {} does not extend the current tail {:?} (parent {:?})",
                    snapshot.id,
                    self.tail_id(),
                    parent
                ),
            );
            event.respond(reply);
            return State::Receiving;
        }
        let Some(archive) = event.payload.take() else {
            event.respond(Event::error(EventName::Error, "missing snapshot archive"));
            return State::Receiving;
        };

        let result = async {
            let mount = self.ctx.engine.mount_path(&self.filesystem_id);
            replace_content(&mount, archive).await?;
            self.ctx
                .engine
                .snapshot(&self.filesystem_id, &snapshot)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    filesystem_id = %self.filesystem_id,
                    snapshot_id = %snapshot.id,
                    "received snapshot"
                );
                let snapshot_id = snapshot.id.clone();
                self.history.push(snapshot);
                event.respond(Event::new(EventName::Received).with_arg("snapshot_id", snapshot_id));
                State::Receiving
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    snapshot_id = %snapshot.id,
                    error = %e,
                    "failed to apply received snapshot"
                );
                event.respond(Event::error(EventName::Error, e));
                self.backoff()
            }
        }
    }

    /// Move mastership to `target`, expecting `expected` (defaults to this
    ///  node when active, otherwise the recorded owner) to hold it now.
    pub(super) async fn handoff(&mut self, event: Event) -> State {
        let Some(target) = event.arg_str("target").map(NodeId::from) else {
            event.respond(Event::error(EventName::Error, "handoff without target"));
            return self.state.clone();
        };
        let expected = match event.arg_str("expected").map(NodeId::from) {
            Some(expected) => expected,
            None if self.state == State::Active => self.ctx.node_id.clone(),
            None => match self.ctx.masters.get_master(&self.filesystem_id).await {
                Ok(master) => master.node_id,
                Err(e) => {
                    event.respond(Event::error(EventName::Error, e));
                    return self.state.clone();
                }
            },
        };

        let handoff = Handoff::new(self.ctx.masters.clone()).with_observer(self.ctx.observer.clone());
        match handoff
            .run(&self.filesystem_id, &target, &expected, RetryPolicy::Abort)
            .await
        {
            Ok(outcome) => {
                let next = if outcome.current == self.ctx.node_id {
                    State::Active
                } else {
                    State::Passive
                };
                event.respond(
                    Event::new(EventName::HandoffComplete)
                        .with_arg("previous", outcome.previous.to_string())
                        .with_arg("current", outcome.current.to_string()),
                );
                next
            }
            Err(HandoffError::Conflict {
                expected, current, ..
            }) => {
                event.respond(
                    Event::new(EventName::HandoffConflict)
                        .with_arg("expected", expected.to_string())
                        .with_arg(
                            "current",
                            current.map(|c| Value::from(c.to_string())).unwrap_or(Value::Null),
                        ),
                );
                self.state.clone()
            }
            Err(e @ HandoffError::NotFound(_)) => {
                event.respond(Event::error(EventName::Error, e));
                self.state.clone()
            }
            Err(e) => {
                tracing::error!(filesystem_id = %self.filesystem_id, error = %e, "handoff failed");
                event.respond(Event::error(EventName::Error, e));
                self.backoff()
            }
        }
    }

    /// Drop the master record, then remove local data on the way to `deleted`
    pub(super) async fn delete(&mut self, mut event: Event) -> State {
        match self.ctx.masters.delete_master(&self.filesystem_id).await {
            Ok(()) | Err(MasterStoreError::NotFound(_)) => {
                self.pending_delete = event.take_responder();
                State::Deleting
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to delete master record"
                );
                event.respond(Event::error(EventName::Error, e));
                self.backoff()
            }
        }
    }
}

/// Tar a directory into memory
async fn archive_dir(path: &std::path::Path) -> std::io::Result<Bytes> {
    let mut builder = tokio_tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", path).await?;
    Ok(Bytes::from(builder.into_inner().await?))
}

/// Swap the live content for the archive's
async fn replace_content(mount: &std::path::Path, archive: Bytes) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(mount).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(mount).await?;
    tokio_tar::Archive::new(Cursor::new(archive))
        .unpack(mount)
        .await?;
    Ok(())
}
