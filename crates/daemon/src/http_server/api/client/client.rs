use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use url::Url;

use super::error::ApiError;
use super::{endpoint, ApiRequest};

#[derive(Debug, Clone)]
pub struct ApiClient {
    pub remote: Url,
    client: Client,
}

impl ApiClient {
    /// Client for the node at `remote`, sending basic-auth `credentials`
    ///  with every request when given
    pub fn new(remote: &Url, credentials: Option<(&str, &str)>) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        if let Some((username, password)) = credentials {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            let mut value = HeaderValue::from_str(&format!("Basic {}", token))?;
            value.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    pub async fn call<T: ApiRequest>(&self, request: T) -> Result<T::Response, ApiError> {
        let request_builder = request.build_request(&self.remote, &self.client);
        let response = request_builder.send().await?;

        if response.status().is_success() {
            Ok(response.json::<T::Response>().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }

    /// Upload `content` as `path` in a dot. Returns the snapshot id the
    ///  upload was committed as.
    pub async fn put_file(
        &self,
        filesystem_id: &str,
        path: &str,
        content: impl Into<reqwest::Body>,
    ) -> Result<crate::http_server::api::v0::dots::PutFileResponse, ApiError> {
        let url = file_url(&self.remote, filesystem_id, path);
        let response = self.client.put(url).body(content).send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }

    /// Download `path` from a dot, optionally as of a snapshot. Directories
    ///  come back as a tar archive.
    pub async fn get_file(
        &self,
        filesystem_id: &str,
        path: &str,
        snapshot_id: Option<&str>,
    ) -> Result<Bytes, ApiError> {
        let mut url = file_url(&self.remote, filesystem_id, path);
        if let Some(snapshot_id) = snapshot_id {
            url.query_pairs_mut().append_pair("snapshot", snapshot_id);
        }
        let response = self.client.get(url).send().await?;
        if response.status().is_success() {
            Ok(response.bytes().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }

    /// Get the base URL for API requests
    pub fn base_url(&self) -> &Url {
        &self.remote
    }

    /// Get the underlying HTTP client for custom requests
    pub fn http_client(&self) -> &Client {
        &self.client
    }
}

fn file_url(base: &Url, filesystem_id: &str, path: &str) -> Url {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        endpoint(base, &format!("/api/v0/dots/{}/files", filesystem_id))
    } else {
        endpoint(base, &format!("/api/v0/dots/{}/files/{}", filesystem_id, path))
    }
}
