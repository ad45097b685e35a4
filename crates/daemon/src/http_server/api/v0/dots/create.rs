use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::auth::AuthError;
use common::types::{FilesystemId, VolumeName};

use super::{Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::plugin::parse_volume;
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct CreateRequest {
    /// Name of the dot, `[namespace/]name`
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    pub filesystem_id: FilesystemId,
    pub name: VolumeName,
}

/// Create a dot, or return the existing one of that name
pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Json(req): Json<CreateRequest>,
) -> Result<impl IntoResponse, DotsError> {
    let volume = parse_volume(&req.name).map_err(|e| DotsError::BadRequest(e.to_string()))?;
    let name = volume.name;

    // creating in someone else's namespace takes admin rights over it
    if name.namespace != caller.user().name
        && !state
            .authorizer()
            .user_is_namespace_administrator(caller.user(), &name.namespace)
            .await?
    {
        return Err(AuthError::Forbidden {
            user: caller.user().name.clone(),
            resource: name.namespace.clone(),
        }
        .into());
    }

    let filesystem_id = state.registry().procure(caller.context(), &name).await?;

    Ok((
        http::StatusCode::OK,
        Json(CreateResponse {
            filesystem_id,
            name,
        }),
    )
        .into_response())
}

impl ApiRequest for CreateRequest {
    type Response = CreateResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client.post(endpoint(base_url, "/api/v0/dots")).json(&self)
    }
}
