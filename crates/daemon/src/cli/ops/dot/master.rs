use clap::Args;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::api::v0::dots::MasterRequest;

#[derive(Args, Debug, Clone)]
pub struct Master {
    /// Id of the dot
    pub filesystem_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Master {
    type Error = MasterError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let response = ctx
            .client
            .call(MasterRequest {
                filesystem_id: self.filesystem_id.clone(),
            })
            .await?;
        Ok(response.node_id.to_string())
    }
}
