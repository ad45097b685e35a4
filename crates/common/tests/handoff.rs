//! Integration tests for moving mastership and content between nodes
//!
//! Two nodes share one store and one observer, as they would share a
//! cluster's store and notification fan-out.

mod common;

use ::common::fsm::{Event, EventName, MessageSender, Notification};
use ::common::kv::MemoryKv;
use ::common::observer::Observer;
use serde_json::json;

fn cluster() -> (common::TestNode, common::TestNode) {
    let kv = MemoryKv::new();
    let observer: Observer<Notification> = Observer::new("cluster");
    (
        common::setup_cluster_node("node-a", kv.clone(), observer.clone()),
        common::setup_cluster_node("node-b", kv, observer),
    )
}

async fn is_active(sender: &MessageSender) -> bool {
    let reply = common::request(sender, Event::new(EventName::Snapshotted)).await;
    reply.arg_str("state") == Some("active")
}

#[tokio::test]
async fn test_second_node_starts_passive() {
    let (a, b) = cluster();
    let (id, _on_a) = common::procure(&a, "shared").await;
    let on_b = b.registry.get_or_spawn(&id);

    let reply = common::save(&on_b, "a.txt", b"x").await;
    assert!(reply.is(EventName::NotMaster), "unexpected {:?}", reply);
    let reply = common::request(&on_b, Event::new(EventName::Snapshot)).await;
    assert!(reply.is(EventName::NotMaster));
}

#[tokio::test]
async fn test_handoff_moves_writes() {
    let (a, b) = cluster();
    let _watch_a = a.registry.watch_masters();
    let _watch_b = b.registry.watch_masters();

    let (id, on_a) = common::procure(&a, "moving").await;
    let on_b = b.registry.get_or_spawn(&id);
    assert!(!is_active(&on_b).await);

    let reply = common::request(
        &on_a,
        Event::new(EventName::Handoff).with_arg("target", "node-b"),
    )
    .await;
    assert!(reply.is(EventName::HandoffComplete), "unexpected {:?}", reply);
    assert_eq!(reply.arg_str("previous"), Some("node-a"));
    assert_eq!(reply.arg_str("current"), Some("node-b"));

    let master = a.registry.context().masters.get_master(&id).await.unwrap();
    assert_eq!(master.node_id.as_str(), "node-b");

    assert!(common::eventually(|| is_active(&on_b)).await);
    assert!(common::save(&on_b, "b.txt", b"y").await.is(EventName::SaveSuccess));
    assert!(common::save(&on_a, "a.txt", b"x").await.is(EventName::NotMaster));
}

#[tokio::test]
async fn test_stale_handoff_conflicts() {
    let (a, _b) = cluster();
    let (_id, on_a) = common::procure(&a, "contested").await;

    let reply = common::request(
        &on_a,
        Event::new(EventName::Handoff)
            .with_arg("target", "node-b")
            .with_arg("expected", "node-c"),
    )
    .await;
    assert!(reply.is(EventName::HandoffConflict), "unexpected {:?}", reply);
    assert_eq!(reply.arg_str("current"), Some("node-a"));

    // still master
    assert!(common::save(&on_a, "a.txt", b"x").await.is(EventName::SaveSuccess));
}

#[tokio::test]
async fn test_push_and_receive() {
    let (a, b) = cluster();
    let (id, on_a) = common::procure(&a, "replicated").await;
    let saved = common::save(&on_a, "data.txt", b"replica").await;
    let snapshot_id = saved.arg_str("snapshot_id").unwrap().to_string();

    let mut pushed = common::request(&on_a, Event::new(EventName::Push)).await;
    assert!(pushed.is(EventName::Pushed), "unexpected {:?}", pushed);
    let snapshot = pushed.args["snapshots"][0].clone();
    let archive = pushed.payload.take().expect("push carries an archive");

    let on_b = b.registry.get_or_spawn(&id);
    let started = common::request(&on_b, Event::new(EventName::ReceiveStart)).await;
    assert!(started.is(EventName::Received));
    assert_eq!(started.args["tail"], json!(null));

    // reads are refused mid-transfer
    let (reply, _) = common::read(&on_b, "data.txt", None).await;
    assert!(reply.is(EventName::ReadFailed));

    let received = common::request(
        &on_b,
        Event::new(EventName::ReceiveSnapshot)
            .with_arg("snapshot", snapshot)
            .with_payload(archive),
    )
    .await;
    assert!(received.is(EventName::Received), "unexpected {:?}", received);
    assert_eq!(received.arg_str("snapshot_id"), Some(snapshot_id.as_str()));

    let done = common::request(&on_b, Event::new(EventName::ReceiveDone)).await;
    assert!(done.is(EventName::Received));

    assert_eq!(common::snapshot_ids(&on_b).await, vec![snapshot_id.clone()]);
    let (reply, bytes) = common::read(&on_b, "data.txt", Some(&snapshot_id)).await;
    assert!(reply.is(EventName::ReadSuccess), "unexpected {:?}", reply);
    assert_eq!(bytes, b"replica");
}

#[tokio::test]
async fn test_push_since_exports_only_newer_snapshots() {
    let (a, _b) = cluster();
    let (_id, on_a) = common::procure(&a, "incremental").await;
    let first = common::save(&on_a, "one.txt", b"1").await;
    let first = first.arg_str("snapshot_id").unwrap().to_string();
    let second = common::save(&on_a, "two.txt", b"2").await;
    let second = second.arg_str("snapshot_id").unwrap().to_string();

    let pushed = common::request(
        &on_a,
        Event::new(EventName::Push).with_arg("since", first.as_str()),
    )
    .await;
    assert!(pushed.is(EventName::Pushed), "unexpected {:?}", pushed);
    let snapshots = pushed.args["snapshots"].as_array().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0]["id"], json!(second));
    assert!(pushed.payload.is_some());

    let unknown = common::request(
        &on_a,
        Event::new(EventName::Push).with_arg("since", "no-such-snapshot"),
    )
    .await;
    assert!(unknown.is(EventName::Error), "unexpected {:?}", unknown);

    // the machine still serves after the refusal
    assert!(common::save(&on_a, "three.txt", b"3").await.is(EventName::SaveSuccess));
}

#[tokio::test]
async fn test_receive_rejects_gap() {
    let (a, b) = cluster();
    let (id, on_a) = common::procure(&a, "gapped").await;
    common::save(&on_a, "one.txt", b"1").await;
    common::save(&on_a, "two.txt", b"2").await;

    let mut pushed = common::request(&on_a, Event::new(EventName::Push)).await;
    let second = pushed.args["snapshots"][1].clone();
    let archive = pushed.payload.take().unwrap();

    let on_b = b.registry.get_or_spawn(&id);
    common::request(&on_b, Event::new(EventName::ReceiveStart)).await;
    let reply = common::request(
        &on_b,
        Event::new(EventName::ReceiveSnapshot)
            .with_arg("snapshot", second)
            .with_arg("parent", "not-the-tail")
            .with_payload(archive),
    )
    .await;
    assert!(reply.is(EventName::Error), "unexpected {:?}", reply);
}

#[tokio::test]
async fn test_clone_is_mastered_locally() {
    let (a, _b) = cluster();
    let (_id, on_a) = common::procure(&a, "origin").await;
    common::save(&on_a, "seed.txt", b"seed").await;

    let cloned = common::request(&on_a, Event::new(EventName::Clone)).await;
    assert!(cloned.is(EventName::Cloned), "unexpected {:?}", cloned);
    let branch = cloned.arg_str("filesystem_id").unwrap().into();

    let on_branch = a.registry.get_or_spawn(&branch);
    let (reply, bytes) = common::read(&on_branch, "seed.txt", None).await;
    assert!(reply.is(EventName::ReadSuccess), "unexpected {:?}", reply);
    assert_eq!(bytes, b"seed");
    assert!(common::save(&on_branch, "more.txt", b"m").await.is(EventName::SaveSuccess));
}
