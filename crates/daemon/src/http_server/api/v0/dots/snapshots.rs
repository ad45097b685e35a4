use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::fsm::{Event, EventName, Snapshot};
use common::types::FilesystemId;

use super::{authorize, expect_reply, Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct SnapshotsRequest {
    /// Id of the dot
    pub filesystem_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    pub filesystem_id: FilesystemId,
    /// Oldest first
    pub snapshots: Vec<Snapshot>,
}

pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    authorize(&state, &caller, &filesystem_id, false).await?;

    let reply = state
        .registry()
        .get_or_spawn(&filesystem_id)
        .request(Event::new(EventName::ListSnapshots))
        .await?;
    let reply = expect_reply(reply, EventName::Snapshots)?;
    let snapshots = reply
        .args
        .get("snapshots")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| DotsError::Reply {
            name: reply.name,
            message: format!("malformed snapshot list: {}", e),
        })?
        .unwrap_or_default();

    Ok((
        http::StatusCode::OK,
        Json(SnapshotsResponse {
            filesystem_id,
            snapshots,
        }),
    )
        .into_response())
}

impl ApiRequest for SnapshotsRequest {
    type Response = SnapshotsResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.get(endpoint(
            base_url,
            &format!("/api/v0/dots/{}/snapshots", self.filesystem_id),
        ))
    }
}
