//! Core of the dots storage manager.
//!
//! Every dot is a named, snapshot-able filesystem with a replicated lifecycle.
//! This crate holds the pieces that govern that lifecycle on a single node:
//!
//! - [`kv`]: the provider seam over the cluster's linearizable key-value store
//! - [`master`]: the typed mastership record and the CAS-driven handoff
//! - [`observer`]: in-process topic fan-out with bounded-stall delivery
//! - [`fsm`]: one sequential state machine per filesystem id, plus the registry
//!   that spawns and tears them down
//! - [`auth`]: request-scoped identity and the authorization seam

pub mod auth;
pub mod fsm;
pub mod kv;
pub mod master;
pub mod observer;
pub mod types;

pub mod prelude {
    pub use crate::auth::{AuthError, AuthenticationType, Authorizer, RequestContext, User};
    pub use crate::fsm::{
        Event, EventName, FsRegistry, InputFile, LocalEngine, MachineContext, Message,
        MessageSender, Notification, OutputFile, Snapshot, SnapshotEngine, State,
    };
    pub use crate::kv::{KvError, KvNode, KvProvider, MemoryKv};
    pub use crate::master::{
        FilesystemMaster, Handoff, HandoffError, HandoffOutcome, MasterChanged, MasterStore,
        MasterStoreError, RetryPolicy, SetOptions,
    };
    pub use crate::observer::Observer;
    pub use crate::types::{FilesystemId, NodeId, TopLevelFilesystem, VolumeName};
}
