use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use common::fsm::{Event, EventName};
use common::types::FilesystemId;

use super::{authorize, expect_reply, Caller, DotsError};
use crate::http_server::api::client::{endpoint, ApiRequest};
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct HandoffRequest {
    /// Id of the dot to hand off
    #[serde(skip)]
    pub filesystem_id: String,

    /// Node to move mastership to
    #[arg(long)]
    pub target: String,

    /// Node expected to hold mastership now; the move fails if it does not
    #[arg(long)]
    #[serde(default)]
    pub expected: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResponse {
    pub filesystem_id: FilesystemId,
    pub previous: Option<String>,
    pub current: String,
}

pub async fn handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<HandoffRequest>,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    authorize(&state, &caller, &filesystem_id, true).await?;

    let mut event = Event::new(EventName::Handoff).with_arg("target", req.target.clone());
    if let Some(expected) = req.expected {
        event = event.with_arg("expected", expected);
    }
    let reply = state
        .registry()
        .get_or_spawn(&filesystem_id)
        .request(event)
        .await?;

    if reply.is(EventName::HandoffConflict) {
        return Err(DotsError::Reply {
            name: reply.name,
            message: format!(
                "expected {} to be master, found {}",
                reply.arg_str("expected").unwrap_or("?"),
                reply.arg_str("current").unwrap_or("nobody"),
            ),
        });
    }
    let reply = expect_reply(reply, EventName::HandoffComplete)?;
    tracing::info!(
        filesystem_id = %filesystem_id,
        target = %req.target,
        user = %caller.user().name,
        "handoff requested over api"
    );

    Ok((
        http::StatusCode::OK,
        Json(HandoffResponse {
            filesystem_id,
            previous: reply.arg_str("previous").map(str::to_string),
            current: reply
                .arg_str("current")
                .unwrap_or(req.target.as_str())
                .to_string(),
        }),
    )
        .into_response())
}

impl ApiRequest for HandoffRequest {
    type Response = HandoffResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        client
            .post(endpoint(
                base_url,
                &format!("/api/v0/dots/{}/handoff", self.filesystem_id),
            ))
            .json(&self)
    }
}
