//! Typed client for the node's HTTP API.
//!
//! Every endpoint's request type implements [`ApiRequest`], so the CLI and
//! tests speak to the daemon with the same types the handlers decode.

mod client;
mod error;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

pub use client::ApiClient;
pub use error::ApiError;

pub trait ApiRequest {
    type Response: DeserializeOwned;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder;
}

/// `base_url` with its path replaced by `path`
pub fn endpoint(base_url: &Url, path: &str) -> Url {
    let mut url = base_url.clone();
    url.set_path(path);
    url.set_query(None);
    url
}
