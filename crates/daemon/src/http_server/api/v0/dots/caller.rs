use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::Engine;

use common::auth::{RequestContext, User};

use super::DotsError;
use crate::ServiceState;

/// The authenticated user behind a request.
///
/// Built from HTTP basic credentials, which the node's authorizer checks
///  before any handler runs.
#[derive(Debug, Clone)]
pub struct Caller(RequestContext);

impl Caller {
    pub fn context(&self) -> &RequestContext {
        &self.0
    }

    pub fn user(&self) -> &User {
        &self.0.user
    }
}

#[async_trait]
impl FromRequestParts<ServiceState> for Caller {
    type Rejection = DotsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let (username, password) =
            basic_credentials(parts).ok_or(DotsError::MissingCredentials)?;
        let (user, authentication) = state
            .authorizer()
            .authenticate(&username, &password)
            .await?;
        tracing::debug!(user = %user.name, authentication = %authentication, "authenticated request");
        Ok(Caller(RequestContext::new(user, authentication)))
    }
}

fn basic_credentials(parts: &Parts) -> Option<(String, String)> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut request = Request::builder().uri("/");
        if let Some(header) = header {
            request = request.header(AUTHORIZATION, header);
        }
        request.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_basic_credentials() {
        // "alice:s3:cret"
        let parts = parts(Some("Basic YWxpY2U6czM6Y3JldA=="));
        assert_eq!(
            basic_credentials(&parts),
            Some(("alice".to_string(), "s3:cret".to_string()))
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert_eq!(basic_credentials(&parts(None)), None);
        assert_eq!(basic_credentials(&parts(Some("Bearer abc"))), None);
        assert_eq!(basic_credentials(&parts(Some("Basic !!!"))), None);
    }
}
