use clap::Args;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::DeleteRequest;

#[derive(Args, Debug, Clone)]
pub struct Delete {
    /// Id of the dot to delete
    pub filesystem_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Delete {
    type Error = DeleteError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx
            .client
            .call(DeleteRequest {
                filesystem_id: self.filesystem_id.clone(),
            })
            .await?;
        Ok(format!("Deleted {}", response.filesystem_id))
    }
}
