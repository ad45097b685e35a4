use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use common::fsm::Snapshot;
use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::SnapshotsRequest;

#[derive(Args, Debug, Clone)]
pub struct Snapshots {
    /// Id of the dot
    pub filesystem_id: String,
}

#[derive(Debug)]
pub struct SnapshotsOutput {
    pub snapshots: Vec<Snapshot>,
}

impl fmt::Display for SnapshotsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.snapshots.is_empty() {
            return write!(f, "{}", "No snapshots".dimmed());
        }

        // newest first, like a commit log
        for (i, snapshot) in self.snapshots.iter().rev().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{} {}", "snapshot".yellow(), snapshot.id.yellow())?;
            if let Some(author) = snapshot.metadata.get("author") {
                writeln!(f, "{} {}", "Author:".dimmed(), author)?;
            }
            write!(f, "{} {}", "Date:".dimmed(), snapshot.created_at)?;
            if let Some(message) = snapshot.metadata.get("message").filter(|m| !m.is_empty()) {
                write!(f, "\n\n    {}", message)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotsError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Snapshots {
    type Error = SnapshotsError;
    type Output = SnapshotsOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx
            .client
            .call(SnapshotsRequest {
                filesystem_id: self.filesystem_id.clone(),
            })
            .await?;
        Ok(SnapshotsOutput {
            snapshots: response.snapshots,
        })
    }
}
