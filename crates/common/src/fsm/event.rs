use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Names of requests into a machine and of the replies it sends back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    // requests
    Snapshot,
    SaveFile,
    ReadFile,
    Clone,
    Push,
    ReceiveStart,
    ReceiveSnapshot,
    ReceiveDone,
    Handoff,
    MasterChanged,
    ListSnapshots,
    Delete,
    // replies
    Snapshotted,
    SnapshotFailed,
    SaveSuccess,
    SaveFailed,
    ReadSuccess,
    ReadFailed,
    FileNotFound,
    Cloned,
    Pushed,
    Received,
    HandoffComplete,
    HandoffConflict,
    Snapshots,
    Deleted,
    Busy,
    NotMaster,
    Unhandled,
    Error,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Snapshot => "snapshot",
            EventName::SaveFile => "save-file",
            EventName::ReadFile => "read-file",
            EventName::Clone => "clone",
            EventName::Push => "push",
            EventName::ReceiveStart => "receive-start",
            EventName::ReceiveSnapshot => "receive-snapshot",
            EventName::ReceiveDone => "receive-done",
            EventName::Handoff => "handoff",
            EventName::MasterChanged => "master-changed",
            EventName::ListSnapshots => "list-snapshots",
            EventName::Delete => "delete",
            EventName::Snapshotted => "snapshotted",
            EventName::SnapshotFailed => "snapshot-failed",
            EventName::SaveSuccess => "save-success",
            EventName::SaveFailed => "save-failed",
            EventName::ReadSuccess => "read-success",
            EventName::ReadFailed => "read-failed",
            EventName::FileNotFound => "file-not-found",
            EventName::Cloned => "cloned",
            EventName::Pushed => "pushed",
            EventName::Received => "received",
            EventName::HandoffComplete => "handoff-complete",
            EventName::HandoffConflict => "handoff-conflict",
            EventName::Snapshots => "snapshots",
            EventName::Deleted => "deleted",
            EventName::Busy => "busy",
            EventName::NotMaster => "not-master",
            EventName::Unhandled => "unhandled",
            EventName::Error => "error",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type EventArgs = serde_json::Map<String, Value>;

/// Reply side of a request.
///
/// Sends at most one reply. If it is dropped without having replied (the
///  request was discarded, or the machine went away) an `error` event is
///  sent in its place, so whoever holds the receiver always hears back.
pub struct Responder(Option<oneshot::Sender<Event>>);

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<Event>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub fn send(mut self, reply: Event) {
        if let Some(tx) = self.0.take() {
            // the requester may have stopped waiting
            let _ = tx.send(reply);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Event::error(
                EventName::Error,
                "request was dropped before it was handled",
            ));
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Responder(pending)"
        } else {
            "Responder(sent)"
        })
    }
}

/// A request into a machine, or a reply out of one
#[derive(Debug)]
pub struct Event {
    pub name: EventName,
    pub args: EventArgs,
    /// Archive bytes carried by push/receive traffic
    pub payload: Option<Bytes>,
    response: Option<Responder>,
}

impl Event {
    pub fn new(name: EventName) -> Self {
        Self {
            name,
            args: EventArgs::new(),
            payload: None,
            response: None,
        }
    }

    /// A request paired with the receiver its single reply will arrive on
    pub fn request(name: EventName) -> (Self, oneshot::Receiver<Event>) {
        let (responder, rx) = Responder::channel();
        let mut event = Self::new(name);
        event.response = Some(responder);
        (event, rx)
    }

    /// A reply carrying the cause of a failure under `err`
    pub fn error(name: EventName, err: impl fmt::Display) -> Self {
        Self::new(name).with_arg("err", err.to_string())
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_args(mut self, args: EventArgs) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn err(&self) -> Option<&str> {
        self.arg_str("err")
    }

    pub fn is(&self, name: EventName) -> bool {
        self.name == name
    }

    pub fn has_responder(&self) -> bool {
        self.response.is_some()
    }

    /// Attach a fresh responder, replacing (and so answering) any existing one
    pub fn expect_reply(&mut self) -> oneshot::Receiver<Event> {
        let (responder, rx) = Responder::channel();
        self.response = Some(responder);
        rx
    }

    pub(crate) fn take_responder(&mut self) -> Option<Responder> {
        self.response.take()
    }

    /// Send `reply` to whoever is waiting on this event, if anyone
    pub fn respond(mut self, reply: Event) {
        if let Some(responder) = self.response.take() {
            responder.send(reply);
        }
    }
}

/// Content to be written into a filesystem
pub struct InputFile {
    /// Path relative to the filesystem's default subvolume
    pub filename: String,
    pub contents: Box<dyn AsyncRead + Send + Unpin>,
    /// Recorded as the author of the resulting snapshot
    pub user: String,
    pub(crate) response: Responder,
}

impl InputFile {
    pub fn new(
        filename: impl Into<String>,
        contents: impl AsyncRead + Send + Unpin + 'static,
        user: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Event>) {
        let (response, rx) = Responder::channel();
        (
            Self {
                filename: filename.into(),
                contents: Box::new(contents),
                user: user.into(),
                response,
            },
            rx,
        )
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFile")
            .field("filename", &self.filename)
            .field("user", &self.user)
            .finish()
    }
}

/// A destination for content read out of a filesystem
pub struct OutputFile {
    /// Path relative to the default subvolume; empty means the whole subvolume
    pub filename: String,
    pub contents: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read from this snapshot instead of the live filesystem
    pub snapshot_id: Option<String>,
    pub(crate) response: Responder,
}

impl OutputFile {
    pub fn new(
        filename: impl Into<String>,
        contents: impl AsyncWrite + Send + Unpin + 'static,
    ) -> (Self, oneshot::Receiver<Event>) {
        let (response, rx) = Responder::channel();
        (
            Self {
                filename: filename.into(),
                contents: Box::new(contents),
                snapshot_id: None,
                response,
            },
            rx,
        )
    }

    pub fn at_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }
}

impl fmt::Debug for OutputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputFile")
            .field("filename", &self.filename)
            .field("snapshot_id", &self.snapshot_id)
            .finish()
    }
}

/// Everything a machine's inbox can carry
#[derive(Debug)]
pub enum Message {
    Event(Event),
    SaveFile(InputFile),
    ReadFile(OutputFile),
}

impl Message {
    pub fn name(&self) -> EventName {
        match self {
            Message::Event(event) => event.name,
            Message::SaveFile(_) => EventName::SaveFile,
            Message::ReadFile(_) => EventName::ReadFile,
        }
    }

    /// Answer the message without handling it
    pub fn reply(self, reply: Event) {
        match self {
            Message::Event(event) => event.respond(reply),
            Message::SaveFile(file) => file.response.send(reply),
            Message::ReadFile(file) => file.response.send(reply),
        }
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

impl From<InputFile> for Message {
    fn from(file: InputFile) -> Self {
        Message::SaveFile(file)
    }
}

impl From<OutputFile> for Message {
    fn from(file: OutputFile) -> Self {
        Message::ReadFile(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_kebab_case() {
        for name in [
            EventName::SaveFailed,
            EventName::FileNotFound,
            EventName::HandoffConflict,
            EventName::SnapshotFailed,
        ] {
            let json = serde_json::to_value(name).unwrap();
            assert_eq!(json, Value::String(name.as_str().to_string()));
        }
    }

    #[tokio::test]
    async fn test_respond_delivers_reply() {
        let (event, rx) = Event::request(EventName::Snapshot);
        event.respond(Event::new(EventName::Snapshotted).with_arg("id", "abc"));
        let reply = rx.await.unwrap();
        assert!(reply.is(EventName::Snapshotted));
        assert_eq!(reply.arg_str("id"), Some("abc"));
    }

    #[tokio::test]
    async fn test_dropped_request_replies_error() {
        let (event, rx) = Event::request(EventName::Snapshot);
        drop(event);
        let reply = rx.await.unwrap();
        assert!(reply.is(EventName::Error));
        assert!(reply.err().is_some());
    }

    #[tokio::test]
    async fn test_message_reply_for_files() {
        let (input, rx) = InputFile::new("a.txt", tokio::io::empty(), "alice");
        Message::from(input).reply(Event::error(EventName::SaveFailed, "nope"));
        let reply = rx.await.unwrap();
        assert!(reply.is(EventName::SaveFailed));
        assert_eq!(reply.err(), Some("nope"));
    }
}
