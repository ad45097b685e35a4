//! Streaming upload and download of dot content.
//!
//! Bodies are never buffered whole: an upload is piped straight into the
//! machine's `save-file` step, and a download is piped out of `read-file`
//! through an in-memory duplex.

use axum::body::Body;
use axum::extract::{Json, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};

use common::fsm::{sanitize, Event, EventName, InputFile, OutputFile};
use common::types::FilesystemId;

use super::{authorize, expect_reply, Caller, DotsError};
use crate::ServiceState;

/// Bytes buffered between the machine writing a download and the client
///  reading it
const DOWNLOAD_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetFileQuery {
    /// Read as of this snapshot instead of the live content
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutFileResponse {
    pub filesystem_id: FilesystemId,
    pub path: String,
    /// Snapshot committing the upload
    pub snapshot_id: String,
    pub bytes: u64,
}

fn check_path(path: &str) -> Result<(), DotsError> {
    sanitize(path)
        .map(|_| ())
        .map_err(|e| DotsError::BadRequest(e.to_string()))
}

/// Save the request body as a file, committed as a new snapshot
pub async fn put_handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
    body: Body,
) -> Result<impl IntoResponse, DotsError> {
    let filesystem_id = FilesystemId::from(id);
    check_path(&path)?;
    authorize(&state, &caller, &filesystem_id, false).await?;

    let contents = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let (file, rx) = InputFile::new(path.clone(), contents, caller.user().name.clone());
    let reply = state
        .registry()
        .get_or_spawn(&filesystem_id)
        .save_file(file, rx)
        .await?;
    let reply = expect_reply(reply, EventName::SaveSuccess)?;

    Ok((
        http::StatusCode::OK,
        Json(PutFileResponse {
            filesystem_id,
            path,
            snapshot_id: reply.arg_str("snapshot_id").unwrap_or_default().to_string(),
            bytes: reply.args.get("bytes").and_then(|b| b.as_u64()).unwrap_or(0),
        }),
    )
        .into_response())
}

/// Stream a file out, or a tar of a directory
pub async fn get_handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
    Query(query): Query<GetFileQuery>,
) -> Result<Response, DotsError> {
    read(state, caller, FilesystemId::from(id), path, query).await
}

/// Stream a tar of the whole dot
pub async fn get_root_handler(
    State(state): State<ServiceState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(query): Query<GetFileQuery>,
) -> Result<Response, DotsError> {
    read(state, caller, FilesystemId::from(id), String::new(), query).await
}

async fn read(
    state: ServiceState,
    caller: Caller,
    filesystem_id: FilesystemId,
    path: String,
    query: GetFileQuery,
) -> Result<Response, DotsError> {
    check_path(&path)?;
    authorize(&state, &caller, &filesystem_id, false).await?;

    let (writer, reader) = tokio::io::duplex(DOWNLOAD_BUFFER);
    let (mut file, mut rx) = OutputFile::new(path.clone(), writer);
    if let Some(snapshot_id) = query.snapshot {
        file = file.at_snapshot(snapshot_id);
    }
    state.registry().get_or_spawn(&filesystem_id).send(file)?;

    // Wait for whichever comes first: the outcome, or the first bytes. A
    //  failed read writes nothing, so data arriving means the read started.
    let mut reader = BufReader::new(reader);
    let first = tokio::select! {
        biased;
        reply = &mut rx => First::Reply(reply_or_stopped(reply)),
        filled = reader.fill_buf() => First::Data(filled.map(|buf| buf.is_empty())),
    };

    let archive = match first {
        First::Reply(reply) => {
            let reply = expect_reply(reply, EventName::ReadSuccess)?;
            reply.args.get("archive").and_then(|a| a.as_bool()).unwrap_or(false)
        }
        First::Data(Ok(true)) => {
            // writer closed without data: the outcome decides
            let reply = expect_reply(reply_or_stopped(rx.await), EventName::ReadSuccess)?;
            reply.args.get("archive").and_then(|a| a.as_bool()).unwrap_or(false)
        }
        First::Data(Ok(false)) => {
            log_outcome(filesystem_id, path.clone(), rx);
            looks_like_directory(&path)
        }
        First::Data(Err(e)) => {
            return Err(DotsError::Reply {
                name: EventName::ReadFailed,
                message: e.to_string(),
            })
        }
    };

    let content_type = if archive {
        "application/x-tar"
    } else {
        "application/octet-stream"
    };
    Ok((
        http::StatusCode::OK,
        [(CONTENT_TYPE, content_type)],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

enum First {
    Reply(Event),
    Data(std::io::Result<bool>),
}

fn reply_or_stopped(reply: Result<Event, oneshot::error::RecvError>) -> Event {
    reply.unwrap_or_else(|_| Event::error(EventName::Error, "machine stopped without replying"))
}

/// Best guess at whether a streaming read is an archive, before the
///  outcome is known
fn looks_like_directory(path: &str) -> bool {
    path.is_empty() || path.ends_with('/')
}

/// Once the response is streaming, a late failure can only be logged
fn log_outcome(filesystem_id: FilesystemId, path: String, rx: oneshot::Receiver<Event>) {
    tokio::spawn(async move {
        let reply = reply_or_stopped(rx.await);
        if !reply.is(EventName::ReadSuccess) {
            tracing::warn!(
                filesystem_id = %filesystem_id,
                filename = %path,
                response = %reply.name,
                cause = reply.err().unwrap_or_default(),
                "download failed mid-stream"
            );
        }
    });
}
