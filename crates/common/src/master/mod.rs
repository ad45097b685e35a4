//! Mastership of filesystems across the cluster.
//!
//! Exactly one node may accept writes for a filesystem at a time. The
//!  authoritative record of which node that is lives in the distributed store
//!  and only ever changes through compare-and-swap.

mod handoff;
mod store;

use serde::{Deserialize, Serialize};

use crate::types::{FilesystemId, NodeId};

pub use handoff::{
    update_target_master_if_matches, Handoff, HandoffError, HandoffOutcome, RetryPolicy,
};
pub use store::{
    FilesystemMaster, MasterStore, MasterStoreError, PrevExist, SetOptions, MASTERS_PREFIX,
};

/// Observer topic carrying [`MasterChanged`] notifications
pub const MASTER_CHANGED_TOPIC: &str = "master-changed";

/// Mastership of a filesystem moved to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterChanged {
    pub filesystem_id: FilesystemId,
    pub node_id: NodeId,
}
