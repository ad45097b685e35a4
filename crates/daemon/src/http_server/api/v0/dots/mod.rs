//! Dot content and control endpoints
//!
//! - Create, list and delete dots
//! - Upload and download files, read back at any snapshot
//! - Take and list snapshots
//! - Inspect and move mastership

use axum::http::header::WWW_AUTHENTICATE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;

use common::auth::AuthError;
use common::fsm::{Event, EventName, MachineGone, RegistryError};
use common::master::MasterStoreError;
use common::types::{FilesystemId, TopLevelFilesystem};

use crate::ServiceState;

mod caller;
mod create;
mod delete;
mod files;
mod handoff;
mod list;
mod master;
mod snapshot;
mod snapshots;

pub use caller::Caller;
pub use create::{CreateRequest, CreateResponse};
pub use delete::{DeleteRequest, DeleteResponse};
pub use files::{GetFileQuery, PutFileResponse};
pub use handoff::{HandoffRequest, HandoffResponse};
pub use list::{DotInfo, ListRequest, ListResponse};
pub use master::{MasterRequest, MasterResponse};
pub use snapshot::{SnapshotRequest, SnapshotResponse};
pub use snapshots::{SnapshotsRequest, SnapshotsResponse};

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/", post(create::handler).get(list::handler))
        .route("/:id", axum::routing::delete(delete::handler))
        .route("/:id/master", get(master::handler))
        .route("/:id/snapshot", post(snapshot::handler))
        .route("/:id/snapshots", get(snapshots::handler))
        .route("/:id/handoff", post(handoff::handler))
        .route("/:id/files", get(files::get_root_handler))
        .route(
            "/:id/files/*path",
            put(files::put_handler).get(files::get_handler),
        )
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum DotsError {
    #[error("missing or malformed credentials")]
    MissingCredentials,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    MachineGone(#[from] MachineGone),
    #[error(transparent)]
    Master(#[from] MasterStoreError),
    /// The filesystem's machine answered with something other than success
    #[error("{name}: {message}")]
    Reply { name: EventName, message: String },
}

impl DotsError {
    fn status(&self) -> http::StatusCode {
        use http::StatusCode;

        match self {
            DotsError::MissingCredentials | DotsError::Auth(AuthError::Unauthenticated) => {
                StatusCode::UNAUTHORIZED
            }
            DotsError::Auth(AuthError::Http { status, .. }) if *status == 401 || *status == 403 => {
                StatusCode::UNAUTHORIZED
            }
            DotsError::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            DotsError::Auth(_) => StatusCode::BAD_GATEWAY,
            DotsError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DotsError::Registry(RegistryError::NotFound(_))
            | DotsError::Registry(RegistryError::Master(MasterStoreError::NotFound(_)))
            | DotsError::Master(MasterStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            DotsError::Registry(RegistryError::MachineGone(_)) | DotsError::MachineGone(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DotsError::Registry(_) | DotsError::Master(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DotsError::Reply { name, .. } => match name {
                EventName::FileNotFound => StatusCode::NOT_FOUND,
                EventName::NotMaster
                | EventName::HandoffConflict
                | EventName::Unhandled => StatusCode::CONFLICT,
                EventName::Busy => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for DotsError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "dots request failed");
        }
        let body = format!("Error: {}", self);
        if status == http::StatusCode::UNAUTHORIZED {
            return (status, [(WWW_AUTHENTICATE, "Basic realm=\"dots\"")], body).into_response();
        }
        (status, body).into_response()
    }
}

/// Pass `reply` through if it is `expected`, otherwise turn it into an error
pub(crate) fn expect_reply(reply: Event, expected: EventName) -> Result<Event, DotsError> {
    if reply.is(expected) {
        return Ok(reply);
    }
    Err(DotsError::Reply {
        name: reply.name,
        message: reply
            .err()
            .map(str::to_string)
            .unwrap_or_else(|| reply.name.to_string()),
    })
}

/// Look the dot up and check the caller may act on it
pub(crate) async fn authorize(
    state: &ServiceState,
    caller: &Caller,
    filesystem_id: &FilesystemId,
    owner_action: bool,
) -> Result<TopLevelFilesystem, DotsError> {
    let record = state.registry().describe(filesystem_id).await?;
    caller
        .context()
        .require(state.authorizer(), owner_action, &record)
        .await?;
    Ok(record)
}
