use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use common::types::{FilesystemId, VolumeName};
use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::{CreateRequest, CreateResponse};

#[derive(Args, Debug, Clone)]
pub struct Create {
    /// Name of the dot, `[namespace/]name`
    pub name: String,
}

#[derive(Debug)]
pub struct CreateOutput {
    pub name: VolumeName,
    pub filesystem_id: FilesystemId,
}

impl fmt::Display for CreateOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} dot {}",
            "Created".green().bold(),
            self.name.string_without_admin().bold()
        )?;
        write!(f, "  {} {}", "id:".dimmed(), self.filesystem_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Create {
    type Error = CreateError;
    type Output = CreateOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let request = CreateRequest {
            name: self.name.clone(),
        };
        let response: CreateResponse = ctx.client.call(request).await?;

        Ok(CreateOutput {
            name: response.name,
            filesystem_id: response.filesystem_id,
        })
    }
}
