use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use common::auth::{AuthError, AuthenticationType, Authorizer, User};
use common::types::TopLevelFilesystem;

/// How hard to try reaching the authorization service before giving up
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 60,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticateRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticateResponse {
    user: User,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthorizeRequest<'a> {
    user: &'a User,
    owner_action: bool,
    top_level_filesystem: &'a TopLevelFilesystem,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthorizeNamespaceAdminRequest<'a> {
    user: &'a User,
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthorizeResponse {
    allowed: bool,
}

/// Delegates user and permission checks to a remote HTTP service.
///
/// Each operation POSTs a JSON body to `<url>/<operation>`. Only 200 and 201
///  count as success. Any other status is reported straight back, while
///  transport failures and unreadable bodies are retried.
#[derive(Debug, Clone)]
pub struct ExternalAuthorizer {
    url: Url,
    client: Client,
    retry: RetryConfig,
}

impl ExternalAuthorizer {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: Client::new(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/{}", self.url.as_str().trim_end_matches('/'), operation)
    }

    async fn call<B, R>(&self, operation: &str, method: Method, body: &B) -> Result<R, AuthError>
    where
        B: Serialize + std::fmt::Debug + ?Sized,
        R: DeserializeOwned,
    {
        let endpoint = self.endpoint(operation);
        let encoded = serde_json::to_vec(body).map_err(|e| AuthError::Codec(e.to_string()))?;
        let mut last_error = AuthError::Transport(format!("no attempts made to {}", endpoint));

        for attempt in 1..=self.retry.attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay).await;
            }

            let response = match self
                .client
                .request(method.clone(), &endpoint)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(encoded.clone())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "authorization request failed"
                    );
                    last_error = AuthError::Transport(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "failed to read authorization response"
                    );
                    last_error = AuthError::Transport(e.to_string());
                    continue;
                }
            };

            if status != StatusCode::OK && status != StatusCode::CREATED {
                tracing::error!(
                    operation = operation,
                    http_status = %status,
                    "authorization service returned an error"
                );
                return Err(AuthError::Http {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            match serde_json::from_slice(&body) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::error!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "failed to decode authorization response"
                    );
                    last_error = AuthError::Codec(e.to_string());
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl Authorizer for ExternalAuthorizer {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(User, AuthenticationType), AuthError> {
        let response: AuthenticateResponse = self
            .call(
                "user/authenticate",
                Method::POST,
                &AuthenticateRequest { username, password },
            )
            .await?;
        let kind = response.kind.parse()?;
        Ok((response.user, kind))
    }

    async fn authorize(
        &self,
        user: &User,
        owner_action: bool,
        filesystem: &TopLevelFilesystem,
    ) -> Result<bool, AuthError> {
        let response: AuthorizeResponse = self
            .call(
                "authorize",
                Method::POST,
                &AuthorizeRequest {
                    user,
                    owner_action,
                    top_level_filesystem: filesystem,
                },
            )
            .await?;
        Ok(response.allowed)
    }

    async fn user_is_namespace_administrator(
        &self,
        user: &User,
        namespace: &str,
    ) -> Result<bool, AuthError> {
        let response: AuthorizeResponse = self
            .call(
                "authorize-namespace-admin",
                Method::POST,
                &AuthorizeNamespaceAdminRequest { user, namespace },
            )
            .await?;
        Ok(response.allowed)
    }
}
