use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::types::FilesystemId;

use super::{authorize, Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct DeleteRequest {
    /// Id of the dot to delete
    pub filesystem_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub filesystem_id: FilesystemId,
}

/// Delete a dot along with its snapshots, master record and name
pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    authorize(&state, &caller, &filesystem_id, true).await?;

    state.registry().remove(&filesystem_id).await?;
    tracing::info!(filesystem_id = %filesystem_id, user = %caller.user().name, "dot deleted");

    match state
        .mounts()
        .cleanup_stale(&state.registry().context().masters)
        .await
    {
        Ok(removed) if removed > 0 => {
            tracing::debug!(removed = removed, "removed stale container mounts")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to clean up container mounts"),
    }

    Ok((http::StatusCode::OK, Json(DeleteResponse { filesystem_id })).into_response())
}

impl ApiRequest for DeleteRequest {
    type Response = DeleteResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.delete(endpoint(
            base_url,
            &format!("/api/v0/dots/{}", self.filesystem_id),
        ))
    }
}
