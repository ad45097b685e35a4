//! Inbox of a filesystem machine.
//!
//! A flume channel with a single consumer: the machine's own task. Senders
//! are cheap to clone and can be handed to anything that wants to talk to
//! the filesystem; the order in which messages are sent is the order in
//! which they are handled.

use tokio::sync::oneshot;

use super::event::{Event, EventName, InputFile, Message, OutputFile};
use crate::types::FilesystemId;

#[derive(Debug, thiserror::Error)]
#[error("machine for filesystem {0} is no longer running")]
pub struct MachineGone(pub FilesystemId);

/// Handle for enqueueing messages to one filesystem's machine
#[derive(Debug, Clone)]
pub struct MessageSender {
    filesystem_id: FilesystemId,
    tx: flume::Sender<Message>,
}

impl MessageSender {
    /// Create a sender and the receiver the machine will drain
    pub fn new(filesystem_id: FilesystemId) -> (Self, MessageReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { filesystem_id, tx }, MessageReceiver { rx })
    }

    pub fn filesystem_id(&self) -> &FilesystemId {
        &self.filesystem_id
    }

    /// Enqueue without waiting for the outcome.
    ///
    /// Fails only when the machine has stopped. The message is dropped in
    ///  that case, which answers any waiting requester with an `error` reply.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), MachineGone> {
        self.tx
            .send(message.into())
            .map_err(|_| MachineGone(self.filesystem_id.clone()))
    }

    /// Enqueue a request and wait for its single reply
    pub async fn request(&self, mut event: Event) -> Result<Event, MachineGone> {
        let rx = event.expect_reply();
        self.send(event)?;
        Ok(await_reply(rx).await)
    }

    /// Hand content to the machine to be saved, and wait for the outcome
    pub async fn save_file(
        &self,
        file: InputFile,
        reply: oneshot::Receiver<Event>,
    ) -> Result<Event, MachineGone> {
        self.send(file)?;
        Ok(await_reply(reply).await)
    }

    /// Ask the machine to stream content into `file`, and wait for the outcome
    pub async fn read_file(
        &self,
        file: OutputFile,
        reply: oneshot::Receiver<Event>,
    ) -> Result<Event, MachineGone> {
        self.send(file)?;
        Ok(await_reply(reply).await)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

async fn await_reply(rx: oneshot::Receiver<Event>) -> Event {
    // a responder always answers before it goes away
    rx.await.unwrap_or_else(|_| {
        Event::error(EventName::Error, "machine stopped without replying")
    })
}

/// Consumer side, owned by the machine's task
#[derive(Debug)]
pub struct MessageReceiver {
    rx: flume::Receiver<Message>,
}

impl MessageReceiver {
    /// Wait for the next message. `None` once every sender is gone.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.recv_async().await.ok()
    }

    /// Take a message if one is already waiting
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}
