use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::{Event, EventName, Message, Responder};
use super::queue::{MessageReceiver, MessageSender};
use super::snapshot::{Snapshot, SnapshotEngine, StorageError};
use super::state::State;
use super::{filesystem_topic, Notification};
use crate::kv::KvProvider;
use crate::master::{MasterStore, MasterStoreError};
use crate::observer::Observer;
use crate::types::{FilesystemId, NodeId};

/// Everything a machine needs from the node it runs on
#[derive(Debug, Clone)]
pub struct MachineContext<K: KvProvider> {
    pub engine: Arc<dyn SnapshotEngine>,
    pub masters: MasterStore<K>,
    pub observer: Observer<Notification>,
    pub node_id: NodeId,
    /// How long to hold off after a failure
    pub backoff: Duration,
}

/// The sequential actor owning one filesystem's local state
#[derive(Debug)]
pub struct FsMachine<K: KvProvider> {
    pub(super) filesystem_id: FilesystemId,
    pub(super) ctx: MachineContext<K>,
    pub(super) state: State,
    /// Snapshot history, oldest first
    pub(super) history: Vec<Snapshot>,
    /// Reply owed to whoever asked for the delete in progress
    pub(super) pending_delete: Option<Responder>,
}

impl<K: KvProvider> FsMachine<K> {
    pub fn new(filesystem_id: FilesystemId, ctx: MachineContext<K>) -> Self {
        Self {
            filesystem_id,
            ctx,
            state: State::Discovering,
            history: Vec::new(),
            pending_delete: None,
        }
    }

    /// Start a machine on its own task
    pub fn spawn(
        filesystem_id: FilesystemId,
        ctx: MachineContext<K>,
    ) -> (MessageSender, JoinHandle<()>) {
        let (sender, inbox) = MessageSender::new(filesystem_id.clone());
        let machine = Self::new(filesystem_id, ctx);
        let handle = tokio::spawn(machine.run(inbox));
        (sender, handle)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Drain the inbox until the filesystem is deleted or every sender is gone
    pub async fn run(mut self, inbox: MessageReceiver) {
        tracing::info!(
            filesystem_id = %self.filesystem_id,
            node_id = %self.ctx.node_id,
            "filesystem machine started"
        );

        loop {
            self.settle().await;
            if self.state.is_terminal() {
                break;
            }
            let Some(message) = inbox.recv().await else {
                break;
            };
            tracing::debug!(
                filesystem_id = %self.filesystem_id,
                state = %self.state,
                event = %message.name(),
                "handling message"
            );
            let next = self.handle(message).await;
            self.transition(next);
        }

        if self.state.is_terminal() {
            while let Some(message) = inbox.try_recv() {
                message.reply(self.deleted_reply());
            }
        }
        tracing::info!(
            filesystem_id = %self.filesystem_id,
            state = %self.state,
            "filesystem machine stopped"
        );
    }

    /// Run states that act on entry until one is reached that waits for input
    async fn settle(&mut self) {
        while self.state.is_eager() {
            let next = match self.state {
                State::Discovering => self.discover().await,
                State::Deleting => self.delete_local().await,
                _ => break,
            };
            self.transition(next);
        }
    }

    async fn handle(&mut self, message: Message) -> State {
        if let State::Backoff { until } = self.state {
            tokio::time::sleep_until(until).await;
            self.transition(State::Discovering);
            self.settle().await;
        }

        match self.state {
            State::Active => self.active(message).await,
            State::Passive => self.passive(message).await,
            State::Receiving => self.receiving(message).await,
            State::Deleted => {
                message.reply(self.deleted_reply());
                State::Deleted
            }
            // rediscovery failed again
            State::Backoff { .. } | State::Discovering | State::Deleting => {
                message.reply(Event::new(EventName::Busy).with_arg("state", self.state.name()));
                self.state.clone()
            }
        }
    }

    async fn active(&mut self, message: Message) -> State {
        let event = match message {
            Message::SaveFile(file) => return self.save_file(file).await,
            Message::ReadFile(file) => return self.read_file(file, State::Active).await,
            Message::Event(event) => event,
        };

        match event.name {
            EventName::Snapshot => {
                let metadata = metadata_arg(&event);
                let (reply, next) = self.snapshot(metadata).await;
                event.respond(reply);
                next
            }
            EventName::Clone => self.clone_filesystem(event).await,
            EventName::Push => self.push(event, State::Active).await,
            EventName::ListSnapshots => self.list_snapshots(event, State::Active),
            EventName::Handoff => self.handoff(event).await,
            EventName::MasterChanged => self.master_changed(event),
            EventName::Delete => self.delete(event).await,
            EventName::ReceiveStart | EventName::ReceiveSnapshot | EventName::ReceiveDone => {
                event.respond(Event::error(
                    EventName::Error,
                    "filesystem is mastered on this node and cannot receive",
                ));
                State::Active
            }
            _ => self.unhandled(event),
        }
    }

    async fn passive(&mut self, message: Message) -> State {
        let event = match message {
            Message::SaveFile(file) => {
                file.response.send(self.not_master_reply());
                return State::Passive;
            }
            Message::ReadFile(file) => return self.read_file(file, State::Passive).await,
            Message::Event(event) => event,
        };

        match event.name {
            EventName::Snapshot | EventName::Clone | EventName::Delete => {
                let reply = self.not_master_reply();
                event.respond(reply);
                State::Passive
            }
            EventName::Push => self.push(event, State::Passive).await,
            EventName::ListSnapshots => self.list_snapshots(event, State::Passive),
            EventName::Handoff => self.handoff(event).await,
            EventName::MasterChanged => self.master_changed(event),
            EventName::ReceiveStart => {
                tracing::info!(filesystem_id = %self.filesystem_id, "receiving filesystem");
                event.respond(
                    Event::new(EventName::Received)
                        .with_arg("tail", self.tail_id().map(Value::from).unwrap_or(Value::Null)),
                );
                State::Receiving
            }
            EventName::ReceiveSnapshot | EventName::ReceiveDone => {
                event.respond(Event::error(
                    EventName::Error,
                    "filesystem is not receiving; send receive-start first",
                ));
                State::Passive
            }
            _ => self.unhandled(event),
        }
    }

    async fn receiving(&mut self, message: Message) -> State {
        let event = match message {
            Message::SaveFile(file) => {
                file.response
                    .send(Event::error(EventName::SaveFailed, "filesystem is receiving"));
                return State::Receiving;
            }
            Message::ReadFile(file) => {
                file.response
                    .send(Event::error(EventName::ReadFailed, "filesystem is receiving"));
                return State::Receiving;
            }
            Message::Event(event) => event,
        };

        match event.name {
            EventName::ReceiveStart => {
                event.respond(
                    Event::new(EventName::Received)
                        .with_arg("tail", self.tail_id().map(Value::from).unwrap_or(Value::Null)),
                );
                State::Receiving
            }
            EventName::ReceiveSnapshot => self.receive_snapshot(event).await,
            EventName::ReceiveDone => {
                tracing::info!(
                    filesystem_id = %self.filesystem_id,
                    snapshots = self.history.len(),
                    "finished receiving filesystem"
                );
                event.respond(Event::new(EventName::Received).with_arg("done", true));
                State::Discovering
            }
            _ => {
                event.respond(Event::new(EventName::Busy).with_arg("state", "receiving"));
                State::Receiving
            }
        }
    }

    /// Pick a role from the master record and load local history
    async fn discover(&mut self) -> State {
        let master = match self.ctx.masters.get_master(&self.filesystem_id).await {
            Ok(master) => master,
            Err(MasterStoreError::NotFound(_)) => {
                tracing::info!(
                    filesystem_id = %self.filesystem_id,
                    "no master recorded, removing local copy"
                );
                return State::Deleting;
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to read master record"
                );
                return self.backoff();
            }
        };

        if !self.ctx.engine.filesystem_exists(&self.filesystem_id).await {
            if let Err(e) = self.ctx.engine.create_filesystem(&self.filesystem_id).await {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to create local filesystem"
                );
                return self.backoff();
            }
        }

        match self.ctx.engine.list_snapshots(&self.filesystem_id).await {
            Ok(history) => self.history = history,
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to load snapshot history"
                );
                return self.backoff();
            }
        }

        if master.node_id == self.ctx.node_id {
            State::Active
        } else {
            State::Passive
        }
    }

    /// Take a snapshot of the live filesystem. Returns the reply and the
    ///  state to continue in.
    pub(super) async fn snapshot(&mut self, metadata: BTreeMap<String, String>) -> (Event, State) {
        let snapshot = Snapshot::new(metadata);
        match self
            .ctx
            .engine
            .snapshot(&self.filesystem_id, &snapshot)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    filesystem_id = %self.filesystem_id,
                    snapshot_id = %snapshot.id,
                    "snapshotted"
                );
                self.history.push(snapshot.clone());
                self.ctx.observer.publish(
                    &filesystem_topic(&self.filesystem_id),
                    Notification::SnapshotCreated {
                        filesystem_id: self.filesystem_id.clone(),
                        snapshot: snapshot.clone(),
                    },
                );
                let reply = Event::new(EventName::Snapshotted)
                    .with_arg("snapshot_id", snapshot.id.clone())
                    .with_arg("snapshot", snapshot_json(&snapshot));
                (reply, State::Active)
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to snapshot"
                );
                (Event::error(EventName::SnapshotFailed, e), self.backoff())
            }
        }
    }

    fn list_snapshots(&self, event: Event, resume: State) -> State {
        let snapshots: Vec<Value> = self.history.iter().map(snapshot_json).collect();
        event.respond(Event::new(EventName::Snapshots).with_arg("snapshots", snapshots));
        resume
    }

    fn master_changed(&mut self, event: Event) -> State {
        let Some(node_id) = event.arg_str("node_id").map(NodeId::from) else {
            event.respond(Event::error(EventName::Error, "master-changed without node_id"));
            return self.state.clone();
        };
        let next = if node_id == self.ctx.node_id {
            State::Active
        } else {
            State::Passive
        };
        if next != self.state {
            tracing::info!(
                filesystem_id = %self.filesystem_id,
                master = %node_id,
                role = next.name(),
                "observed master change"
            );
        }
        event.respond(
            Event::new(EventName::HandoffComplete).with_arg("current", node_id.to_string()),
        );
        next
    }

    fn unhandled(&self, event: Event) -> State {
        tracing::warn!(
            filesystem_id = %self.filesystem_id,
            state = %self.state,
            event = %event.name,
            "unhandled event"
        );
        let reply = Event::new(EventName::Unhandled)
            .with_arg("event", event.name.as_str())
            .with_arg("state", self.state.name());
        event.respond(reply);
        self.state.clone()
    }

    pub(super) fn backoff(&self) -> State {
        State::Backoff {
            until: Instant::now() + self.ctx.backoff,
        }
    }

    pub(super) fn tail_id(&self) -> Option<&str> {
        self.history.last().map(|s| s.id.as_str())
    }

    fn not_master_reply(&self) -> Event {
        Event::error(
            EventName::NotMaster,
            format!(
                "filesystem {} is mastered on another node",
                self.filesystem_id
            ),
        )
    }

    fn deleted_reply(&self) -> Event {
        Event::error(
            EventName::Error,
            format!("filesystem {} has been deleted", self.filesystem_id),
        )
    }

    fn transition(&mut self, next: State) {
        if next.name() != self.state.name() {
            tracing::debug!(
                filesystem_id = %self.filesystem_id,
                from = self.state.name(),
                to = next.name(),
                "state transition"
            );
            self.ctx.observer.publish(
                &filesystem_topic(&self.filesystem_id),
                Notification::StateChanged {
                    filesystem_id: self.filesystem_id.clone(),
                    from: self.state.name(),
                    to: next.name(),
                },
            );
        }
        self.state = next;
    }

    /// Remove the local copy and finish any pending delete
    async fn delete_local(&mut self) -> State {
        match self
            .ctx
            .engine
            .delete_filesystem(&self.filesystem_id)
            .await
        {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                tracing::info!(filesystem_id = %self.filesystem_id, "filesystem deleted");
                self.history.clear();
                if let Some(responder) = self.pending_delete.take() {
                    responder.send(Event::new(EventName::Deleted));
                }
                State::Deleted
            }
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    error = %e,
                    "failed to delete local filesystem"
                );
                if let Some(responder) = self.pending_delete.take() {
                    responder.send(Event::error(EventName::Error, &e));
                }
                self.backoff()
            }
        }
    }
}

/// Snapshot metadata from a request's `metadata` object
pub(super) fn metadata_arg(event: &Event) -> BTreeMap<String, String> {
    event
        .args
        .get("metadata")
        .and_then(Value::as_object)
        .map(|metadata| {
            metadata
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn snapshot_json(snapshot: &Snapshot) -> Value {
    serde_json::to_value(snapshot).unwrap_or(Value::Null)
}
