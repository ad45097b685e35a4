//! Shared setup for daemon integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use base64::Engine;
use tempfile::TempDir;

use dots_daemon::{Config, ServiceState};

/// A node with its own data dir, container mount prefix and in-memory
///  database. Everything is removed when it drops.
pub struct TestNode {
    pub state: ServiceState,
    pub config: Config,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir, node_id: &str) -> Config {
    Config {
        node_id: node_id.to_string(),
        data_dir: dir.path().join("data"),
        container_mount_prefix: dir.path().join("mnt"),
        sqlite_path: None,
        kv_prefix: "test.dots.io".to_string(),
        api_listen_addr: "127.0.0.1:0".parse().unwrap(),
        plugin_listen_addr: "127.0.0.1:0".parse().unwrap(),
        plugin_spec_dir: Some(dir.path().join("plugins")),
        master_poll_secs: 1,
        log_level: "debug".to_string(),
        ..Default::default()
    }
}

pub async fn setup_node(node_id: &str) -> TestNode {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, node_id);
    let state = ServiceState::from_config(&config).await.unwrap();
    TestNode { state, config, dir }
}

pub fn basic_auth(user: &str, password: &str) -> String {
    let token =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
    format!("Basic {}", token)
}

/// A request authenticated as `user`
pub fn request(method: &str, uri: &str, user: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, basic_auth(user, "secret"))
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

pub fn json_body(value: serde_json::Value) -> Body {
    Body::from(serde_json::to_vec(&value).unwrap())
}

pub async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn mount_root(node: &TestNode) -> PathBuf {
    node.config.container_mount_prefix.clone()
}
