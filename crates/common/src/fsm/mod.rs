//! Per-filesystem state machines.
//!
//! Every filesystem known to a node is driven by exactly one [`FsMachine`],
//! running as its own task and draining its own inbox one message at a time.
//! All mutation of the filesystem's local content and snapshot history
//! happens inside that task; everything else talks to it by enqueueing
//! [`Message`]s through a [`MessageSender`].

mod event;
mod file_io;
mod machine;
mod paths;
mod queue;
mod registry;
mod snapshot;
mod state;
mod transfer;

use crate::master::MasterChanged;
use crate::types::FilesystemId;

pub use event::{Event, EventArgs, EventName, InputFile, Message, OutputFile, Responder};
pub use file_io::FileIoError;
pub use machine::{FsMachine, MachineContext};
pub use paths::{contain, sanitize, InvalidPath};
pub use queue::{MachineGone, MessageReceiver, MessageSender};
pub use registry::{FsRegistry, RegistryError, FILESYSTEMS_PREFIX};
pub use snapshot::{LocalEngine, Snapshot, SnapshotEngine, StorageError};
pub use state::State;

/// Observer topic carrying one filesystem's [`Notification`]s
pub fn filesystem_topic(filesystem_id: &FilesystemId) -> String {
    format!("filesystem/{}", filesystem_id)
}

/// What machines and the handoff coordinator announce on the observer
#[derive(Debug, Clone)]
pub enum Notification {
    StateChanged {
        filesystem_id: FilesystemId,
        from: &'static str,
        to: &'static str,
    },
    SnapshotCreated {
        filesystem_id: FilesystemId,
        snapshot: Snapshot,
    },
    MasterChanged(MasterChanged),
}
