use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::{DotInfo, ListRequest};

#[derive(Args, Debug, Clone)]
pub struct List;

#[derive(Debug)]
pub struct ListOutput {
    pub dots: Vec<DotInfo>,
}

impl fmt::Display for ListOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dots.is_empty() {
            return write!(f, "{}", "No dots found".dimmed());
        }

        for (i, dot) in self.dots.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let master = dot
                .master
                .as_ref()
                .map(|node| node.to_string())
                .unwrap_or_else(|| "-".to_string());
            write!(
                f,
                "{}  {}  {} {}",
                dot.name.bold(),
                dot.filesystem_id.to_string().dimmed(),
                "master:".dimmed(),
                master
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for List {
    type Error = ListError;
    type Output = ListOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx.client.call(ListRequest {}).await?;
        Ok(ListOutput {
            dots: response.dots,
        })
    }
}
