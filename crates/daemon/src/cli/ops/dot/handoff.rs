use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::{HandoffRequest, HandoffResponse};

#[derive(Args, Debug, Clone)]
pub struct Handoff {
    /// Id of the dot to hand off
    pub filesystem_id: String,

    /// Node to move mastership to
    #[arg(long)]
    pub target: String,

    /// Only move if this node is master now
    #[arg(long)]
    pub expected: Option<String>,
}

#[derive(Debug)]
pub struct HandoffOutput(HandoffResponse);

impl fmt::Display for HandoffOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {}",
            "Handed off".green().bold(),
            self.0.filesystem_id,
            self.0.previous.as_deref().unwrap_or("-").dimmed(),
            self.0.current.bold()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Handoff {
    type Error = HandoffError;
    type Output = HandoffOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx
            .client
            .call(HandoffRequest {
                filesystem_id: self.filesystem_id.clone(),
                target: self.target.clone(),
                expected: self.expected.clone(),
            })
            .await?;
        Ok(HandoffOutput(response))
    }
}
