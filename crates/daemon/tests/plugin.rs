//! The docker volume plugin protocol

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use crate::common::{body_json, setup_node, TestNode};
use dots_daemon::http_server::plugin_router;

async fn call(node: &TestNode, path: &str, body: serde_json::Value) -> serde_json::Value {
    let response = plugin_router(node.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/vnd.docker.plugins.v1.2+json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    // the protocol reports failures in the body, never in the status
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_activate_and_capabilities() {
    let node = setup_node("node-a").await;

    let activated = call(&node, "/Plugin.Activate", serde_json::json!({})).await;
    assert_eq!(activated["Implements"], serde_json::json!(["VolumeDriver"]));

    let capabilities = call(&node, "/VolumeDriver.Capabilities", serde_json::json!({})).await;
    assert_eq!(capabilities["Capabilities"]["Scope"], "global");
}

#[tokio::test]
async fn test_create_then_list_and_get() {
    let node = setup_node("node-a").await;

    let created = call(
        &node,
        "/VolumeDriver.Create",
        serde_json::json!({ "Name": "web", "Opts": {} }),
    )
    .await;
    assert_eq!(created["Err"], "");

    let listed = call(&node, "/VolumeDriver.List", serde_json::json!({})).await;
    let volumes = listed["Volumes"].as_array().unwrap();
    assert_eq!(volumes.len(), 1);
    // the admin namespace is implied
    assert_eq!(volumes[0]["Name"], "web");

    let got = call(&node, "/VolumeDriver.Get", serde_json::json!({ "Name": "web" })).await;
    assert_eq!(got["Err"], "");
    assert_eq!(got["Volume"]["Name"], "web");

    let missing = call(&node, "/VolumeDriver.Get", serde_json::json!({ "Name": "ghost" })).await;
    assert_ne!(missing["Err"], "");
}

#[tokio::test]
async fn test_mount_links_into_the_dot() {
    let node = setup_node("node-a").await;

    let mounted = call(
        &node,
        "/VolumeDriver.Mount",
        serde_json::json!({ "Name": "alice/db@logs", "ID": "container-1" }),
    )
    .await;
    assert_eq!(mounted["Err"], "");

    let mountpoint = std::path::PathBuf::from(mounted["Mountpoint"].as_str().unwrap());
    assert!(mountpoint.starts_with(crate::common::mount_root(&node)));
    assert!(mountpoint.ends_with("logs"));
    assert!(mountpoint.is_dir());

    // the dot now exists under its full name
    let filesystems = node.state.registry().filesystems().await.unwrap();
    assert_eq!(filesystems.len(), 1);
    assert_eq!(filesystems[0].0.to_string(), "alice/db");

    // and the link points into its live filesystem
    let link = node
        .state
        .mounts()
        .mountpoint(&filesystems[0].0);
    let target = std::fs::read_link(&link).unwrap();
    assert!(target.ends_with(filesystems[0].1.as_str()));

    let path = call(
        &node,
        "/VolumeDriver.Path",
        serde_json::json!({ "Name": "alice/db@logs" }),
    )
    .await;
    assert_eq!(path["Mountpoint"], mounted["Mountpoint"]);
}

#[tokio::test]
async fn test_bad_names_are_reported_in_err() {
    let node = setup_node("node-a").await;

    let created = call(
        &node,
        "/VolumeDriver.Create",
        serde_json::json!({ "Name": "not a name!" }),
    )
    .await;
    assert_ne!(created["Err"], "");

    let created = call(
        &node,
        "/VolumeDriver.Create",
        serde_json::json!({ "Name": "a/b/c" }),
    )
    .await;
    assert_ne!(created["Err"], "");

    assert!(node.state.registry().filesystems().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_reported_in_err() {
    let node = setup_node("node-a").await;

    let response = plugin_router(node.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/VolumeDriver.Mount")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["Err"].as_str().unwrap().contains("malformed"));
}
