use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::types::{FilesystemId, NodeId};

use super::{authorize, Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct MasterRequest {
    /// Id of the dot
    pub filesystem_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterResponse {
    pub filesystem_id: FilesystemId,
    pub node_id: NodeId,
}

pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    authorize(&state, &caller, &filesystem_id, false).await?;

    let master = state
        .registry()
        .context()
        .masters
        .get_master(&filesystem_id)
        .await?;

    Ok((
        http::StatusCode::OK,
        Json(MasterResponse {
            filesystem_id: master.filesystem_id,
            node_id: master.node_id,
        }),
    )
        .into_response())
}

impl ApiRequest for MasterRequest {
    type Response = MasterResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.get(endpoint(
            base_url,
            &format!("/api/v0/dots/{}/master", self.filesystem_id),
        ))
    }
}
