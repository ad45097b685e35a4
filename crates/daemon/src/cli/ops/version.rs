use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::health::version::{VersionInfo, VersionRequest};

#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Also ask the node at --remote which version it runs
    #[arg(long)]
    pub node: bool,
}

#[derive(Debug)]
pub struct VersionOutput {
    pub local: VersionInfo,
    pub node: Option<Result<VersionInfo, String>>,
}

impl fmt::Display for VersionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.local.name, self.local.version.bold())?;
        match &self.node {
            Some(Ok(info)) => write!(f, "\n{} {}", "node:".dimmed(), info.version),
            Some(Err(e)) => write!(f, "\n{} {}", "node:".dimmed(), e.red()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Version operation failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = VersionError;
    type Output = VersionOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let node = if self.node {
            Some(
                ctx.client
                    .call(VersionRequest {})
                    .await
                    .map_err(|e| e.to_string()),
            )
        } else {
            None
        };
        Ok(VersionOutput {
            local: VersionInfo::current(),
            node,
        })
    }
}
