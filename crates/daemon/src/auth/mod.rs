mod external;

use std::sync::Arc;

use common::auth::{AllowAll, Authorizer};

pub use external::{ExternalAuthorizer, RetryConfig};

/// Pick the authorizer for this node: the remote service when a URL is
///  configured, otherwise everyone is allowed everything.
pub fn authorizer_for(url: Option<&str>) -> Result<Arc<dyn Authorizer>, url::ParseError> {
    match url {
        Some(url) => {
            let url = url::Url::parse(url)?;
            tracing::info!(url = %url, "using external authorization service");
            Ok(Arc::new(ExternalAuthorizer::new(url)))
        }
        None => {
            tracing::warn!("no authorization url configured, allowing all requests");
            Ok(Arc::new(AllowAll))
        }
    }
}
