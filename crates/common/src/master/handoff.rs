//! Mastership handoff between nodes.
//!
//! A handoff is a single compare-and-swap against the master record. The
//! store never retries on its own; whether a lost race is retried against
//! the freshly observed owner or surfaced to the caller is decided here,
//! explicitly, through a [`RetryPolicy`].

use crate::fsm::Notification;
use crate::kv::KvProvider;
use crate::observer::Observer;
use crate::types::{FilesystemId, NodeId};

use super::store::{FilesystemMaster, MasterStore, MasterStoreError};
use super::{MasterChanged, MASTER_CHANGED_TOPIC};

/// What to do when the believed owner turns out to be stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Report the conflict to the caller
    #[default]
    Abort,
    /// Retry against whichever owner the failed attempt observed, up to
    ///  `max_attempts` CAS attempts in total
    RetryWithObserved { max_attempts: u32 },
}

/// Result of a completed handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffOutcome {
    pub filesystem_id: FilesystemId,
    /// Owner the successful CAS replaced
    pub previous: NodeId,
    pub current: NodeId,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error(
        "handoff of {filesystem_id} lost a race: expected owner {expected}, found {current:?}"
    )]
    Conflict {
        filesystem_id: FilesystemId,
        expected: NodeId,
        current: Option<NodeId>,
    },
    #[error("no master recorded for filesystem {0}")]
    NotFound(FilesystemId),
    #[error("master store error: {0}")]
    Store(MasterStoreError),
}

impl From<MasterStoreError> for HandoffError {
    fn from(err: MasterStoreError) -> Self {
        match err {
            MasterStoreError::NotFound(id) => HandoffError::NotFound(id),
            other => HandoffError::Store(other),
        }
    }
}

/// Move mastership of `filesystem_id` to `target`, but only if `expected`
///  still owns it.
pub async fn update_target_master_if_matches<K: KvProvider>(
    store: &MasterStore<K>,
    filesystem_id: &FilesystemId,
    target: &NodeId,
    expected: &NodeId,
) -> Result<FilesystemMaster, MasterStoreError> {
    tracing::debug!(
        filesystem_id = %filesystem_id,
        target = %target,
        expected = %expected,
        "attempting master handoff"
    );
    let result = store
        .update_master_if_matches(filesystem_id, target, expected)
        .await;
    if let Err(MasterStoreError::Conflict { current, .. }) = &result {
        tracing::warn!(
            filesystem_id = %filesystem_id,
            expected = %expected,
            current = ?current,
            "master handoff conflict"
        );
    }
    result
}

/// Drives handoffs and announces the ones that commit.
#[derive(Debug, Clone)]
pub struct Handoff<K: KvProvider> {
    store: MasterStore<K>,
    observer: Option<Observer<Notification>>,
}

impl<K: KvProvider> Handoff<K> {
    pub fn new(store: MasterStore<K>) -> Self {
        Self {
            store,
            observer: None,
        }
    }

    /// Publish committed handoffs on the `master-changed` topic
    pub fn with_observer(mut self, observer: Observer<Notification>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run(
        &self,
        filesystem_id: &FilesystemId,
        target: &NodeId,
        believed_owner: &NodeId,
        policy: RetryPolicy,
    ) -> Result<HandoffOutcome, HandoffError> {
        let max_attempts = match policy {
            RetryPolicy::Abort => 1,
            RetryPolicy::RetryWithObserved { max_attempts } => max_attempts.max(1),
        };

        let mut expected = believed_owner.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match update_target_master_if_matches(&self.store, filesystem_id, target, &expected)
                .await
            {
                Ok(master) => {
                    tracing::info!(
                        filesystem_id = %filesystem_id,
                        from = %expected,
                        to = %master.node_id,
                        attempts,
                        "master handoff committed"
                    );
                    self.announce(&master);
                    return Ok(HandoffOutcome {
                        filesystem_id: filesystem_id.clone(),
                        previous: expected,
                        current: master.node_id,
                        attempts,
                    });
                }
                Err(MasterStoreError::Conflict { current, .. }) => {
                    let observed = match current {
                        Some(observed) if attempts < max_attempts => observed,
                        current => {
                            return Err(HandoffError::Conflict {
                                filesystem_id: filesystem_id.clone(),
                                expected,
                                current,
                            })
                        }
                    };
                    // Someone else already moved it where we wanted it
                    if &observed == target {
                        return Ok(HandoffOutcome {
                            filesystem_id: filesystem_id.clone(),
                            previous: observed.clone(),
                            current: observed,
                            attempts,
                        });
                    }
                    expected = observed;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn announce(&self, master: &FilesystemMaster) {
        if let Some(observer) = &self.observer {
            observer.publish(
                MASTER_CHANGED_TOPIC,
                Notification::MasterChanged(MasterChanged {
                    filesystem_id: master.filesystem_id.clone(),
                    node_id: master.node_id.clone(),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::master::SetOptions;

    async fn seeded(owner: &str) -> MasterStore<MemoryKv> {
        let store = MasterStore::new(MemoryKv::new());
        store
            .set_master(
                &FilesystemMaster::new("fs".into(), owner.into()),
                &SetOptions::default(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_update_succeeds_when_owner_matches() {
        let store = seeded("1").await;
        update_target_master_if_matches(&store, &"fs".into(), &"2".into(), &"1".into())
            .await
            .unwrap();
        assert_eq!(
            store.get_master(&"fs".into()).await.unwrap().node_id,
            NodeId::from("2")
        );
    }

    #[tokio::test]
    async fn test_update_fails_when_owner_differs() {
        let store = seeded("3").await;
        let result =
            update_target_master_if_matches(&store, &"fs".into(), &"2".into(), &"1".into()).await;
        match result {
            Err(MasterStoreError::Conflict { current, .. }) => {
                assert_eq!(current, Some(NodeId::from("3")))
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(
            store.get_master(&"fs".into()).await.unwrap().node_id,
            NodeId::from("3")
        );
    }

    #[tokio::test]
    async fn test_abort_policy_surfaces_conflict() {
        let handoff = Handoff::new(seeded("3").await);
        let result = handoff
            .run(&"fs".into(), &"2".into(), &"1".into(), RetryPolicy::Abort)
            .await;
        assert!(matches!(
            result,
            Err(HandoffError::Conflict { current: Some(ref c), .. }) if c.as_str() == "3"
        ));
    }

    #[tokio::test]
    async fn test_retry_with_observed_owner() {
        let store = seeded("3").await;
        let handoff = Handoff::new(store.clone());
        let outcome = handoff
            .run(
                &"fs".into(),
                &"2".into(),
                &"1".into(),
                RetryPolicy::RetryWithObserved { max_attempts: 3 },
            )
            .await
            .unwrap();
        assert_eq!(outcome.previous, NodeId::from("3"));
        assert_eq!(outcome.current, NodeId::from("2"));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            store.get_master(&"fs".into()).await.unwrap().node_id,
            NodeId::from("2")
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let handoff = Handoff::new(MasterStore::new(MemoryKv::new()));
        let result = handoff
            .run(&"fs".into(), &"2".into(), &"1".into(), RetryPolicy::Abort)
            .await;
        assert!(matches!(result, Err(HandoffError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_committed_handoff_is_announced() {
        let observer = Observer::new("test");
        let (_, rx) = observer.subscribe_channel(MASTER_CHANGED_TOPIC);
        let handoff = Handoff::new(seeded("1").await).with_observer(observer);

        handoff
            .run(&"fs".into(), &"2".into(), &"1".into(), RetryPolicy::Abort)
            .await
            .unwrap();

        match rx.recv_async().await.unwrap() {
            Notification::MasterChanged(changed) => {
                assert_eq!(changed.filesystem_id, FilesystemId::from("fs"));
                assert_eq!(changed.node_id, NodeId::from("2"));
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }
}
