use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;
use tokio::io::AsyncReadExt;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::PutFileResponse;

#[derive(Args, Debug, Clone)]
pub struct Put {
    /// Id of the dot to write into
    pub filesystem_id: String,

    /// Destination path inside the dot
    pub path: String,

    /// Local file to upload; stdin when omitted or `-`
    pub source: Option<PathBuf>,
}

#[derive(Debug)]
pub struct PutOutput(PutFileResponse);

impl fmt::Display for PutOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({} bytes)",
            "Wrote".green().bold(),
            self.0.path.bold(),
            self.0.bytes
        )?;
        write!(f, "  {} {}", "snapshot:".dimmed(), self.0.snapshot_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PutError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Put {
    type Error = PutError;
    type Output = PutOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let content = match self.source.as_ref().filter(|p| p.as_os_str() != "-") {
            Some(path) => tokio::fs::read(path).await.map_err(|source| PutError::Read {
                path: path.display().to_string(),
                source,
            })?,
            None => {
                let mut buf = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|source| PutError::Read {
                        path: "stdin".to_string(),
                        source,
                    })?;
                buf
            }
        };

        let response = ctx
            .client
            .put_file(&self.filesystem_id, &self.path, content)
            .await?;
        Ok(PutOutput(response))
    }
}
