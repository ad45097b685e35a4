use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::SnapshotRequest;

#[derive(Args, Debug, Clone)]
pub struct Snapshot {
    /// Id of the dot to snapshot
    pub filesystem_id: String,

    /// Commit message recorded with the snapshot
    #[arg(long, short)]
    pub message: Option<String>,
}

#[derive(Debug)]
pub struct SnapshotOutput {
    pub filesystem_id: String,
    pub snapshot_id: String,
}

impl fmt::Display for SnapshotOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            "Snapshotted".green().bold(),
            self.filesystem_id,
            "as".dimmed(),
            self.snapshot_id.bold()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Snapshot {
    type Error = SnapshotError;
    type Output = SnapshotOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx
            .client
            .call(SnapshotRequest {
                filesystem_id: self.filesystem_id.clone(),
                message: self.message.clone(),
            })
            .await?;
        Ok(SnapshotOutput {
            filesystem_id: self.filesystem_id.clone(),
            snapshot_id: response.snapshot_id,
        })
    }
}
