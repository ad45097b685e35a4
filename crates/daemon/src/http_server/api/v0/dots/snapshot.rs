use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;

use common::fsm::{Event, EventName};
use common::types::FilesystemId;

use super::{authorize, expect_reply, Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct SnapshotRequest {
    /// Id of the dot to snapshot
    #[serde(skip)]
    pub filesystem_id: String,

    /// Commit message recorded with the snapshot
    #[arg(long, short)]
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot_id: String,
}

pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<SnapshotRequest>,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    authorize(&state, &caller, &filesystem_id, false).await?;

    let metadata = json!({
        "author": caller.user().name,
        "message": req.message.unwrap_or_default(),
        "type": "commit",
    });
    let reply = state
        .registry()
        .get_or_spawn(&filesystem_id)
        .request(Event::new(EventName::Snapshot).with_arg("metadata", metadata))
        .await?;
    let reply = expect_reply(reply, EventName::Snapshotted)?;

    Ok((
        http::StatusCode::OK,
        Json(SnapshotResponse {
            snapshot_id: reply.arg_str("snapshot_id").unwrap_or_default().to_string(),
        }),
    )
        .into_response())
}

impl ApiRequest for SnapshotRequest {
    type Response = SnapshotResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client
            .post(endpoint(
                base_url,
                &format!("/api/v0/dots/{}/snapshot", self.filesystem_id),
            ))
            .json(&self)
    }
}
