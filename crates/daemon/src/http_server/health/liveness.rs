use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::types::NodeId;

use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivezRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivezResponse {
    pub status: String,
    /// Node answering, as it appears in master records
    pub node_id: NodeId,
    /// Filesystem machines currently running on it
    pub machines: usize,
}

impl ApiRequest for LivezRequest {
    type Response = LivezResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.get(endpoint(base_url, "/_status/livez"))
    }
}

/// Answers ok whenever the process can serve HTTP at all. It says nothing
///  about whether any particular dot is healthy.
#[tracing::instrument(skip(state))]
pub async fn handler(State(state): State<ServiceState>) -> Response {
    let registry = state.registry();
    (
        StatusCode::OK,
        Json(LivezResponse {
            status: "ok".to_string(),
            node_id: registry.node_id().clone(),
            machines: registry.ids().len(),
        }),
    )
        .into_response()
}
