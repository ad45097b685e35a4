use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::api::client::ApiError;

#[derive(Args, Debug, Clone)]
pub struct Cat {
    /// Id of the dot to read from
    pub filesystem_id: String,

    /// Path inside the dot; a directory (or nothing) yields a tar archive
    #[arg(default_value = "")]
    pub path: String,

    /// Read as of this snapshot
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Write to this file instead of printing
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Debug)]
pub enum CatOutput {
    Text(String),
    Written { path: PathBuf, bytes: usize },
}

impl fmt::Display for CatOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatOutput::Text(text) => write!(f, "{text}"),
            CatOutput::Written { path, bytes } => write!(
                f,
                "{} {} bytes to {}",
                "Wrote".green().bold(),
                bytes,
                path.display().to_string().bold()
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("content is not text, use --output")]
    Binary,
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Cat {
    type Error = CatError;
    type Output = CatOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let content = ctx
            .client
            .get_file(&self.filesystem_id, &self.path, self.snapshot.as_deref())
            .await?;

        match &self.output {
            Some(path) => {
                tokio::fs::write(path, &content)
                    .await
                    .map_err(|source| CatError::Write {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(CatOutput::Written {
                    path: path.clone(),
                    bytes: content.len(),
                })
            }
            None => String::from_utf8(content.to_vec())
                .map(CatOutput::Text)
                .map_err(|_| CatError::Binary),
        }
    }
}
