use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::master::MasterStoreError;
use common::types::{FilesystemId, NodeId};

use super::{Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct ListRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub dots: Vec<DotInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotInfo {
    pub filesystem_id: FilesystemId,
    /// `namespace/name`
    pub name: String,
    pub owner_id: String,
    /// Node holding mastership, if a master is recorded
    pub master: Option<NodeId>,
}

/// Dots the caller may read, ordered by name
pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
) -> Result<impl IntoResponse, DotsError> {
    let mut dots = Vec::new();
    for (_, filesystem_id) in state.registry().filesystems().await? {
        let record = state.registry().describe(&filesystem_id).await?;
        if !state
            .authorizer()
            .authorize(caller.user(), false, &record)
            .await?
        {
            continue;
        }
        let master = match state
            .registry()
            .context()
            .masters
            .get_master(&filesystem_id)
            .await
        {
            Ok(master) => Some(master.node_id),
            Err(MasterStoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        dots.push(DotInfo {
            filesystem_id,
            name: record.name.to_string(),
            owner_id: record.owner_id,
            master,
        });
    }
    dots.sort_by(|a, b| a.name.cmp(&b.name));

    Ok((http::StatusCode::OK, Json(ListResponse { dots })).into_response())
}

impl ApiRequest for ListRequest {
    type Response = ListResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.get(endpoint(base_url, "/api/v0/dots"))
    }
}
