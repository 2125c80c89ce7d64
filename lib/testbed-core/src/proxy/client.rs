use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use testbed_error::{generic_error, ErrorContext as _, GenericError};

use super::control::{Proxy, Toxic, ToxiproxyApi};

/// Default address of the toxiproxy API.
pub const DEFAULT_TOXIPROXY_URL: &str = "http://localhost:8474";

/// Typed client for the toxiproxy HTTP API.
pub struct ToxiproxyClient {
    inner: Client,
    base_url: String,
}

impl ToxiproxyClient {
    /// Creates a new `ToxiproxyClient` talking to the API at `base_url`.
    pub fn new(inner: Client, base_url: impl Into<String>) -> Self {
        Self {
            inner,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ToxiproxyApi for ToxiproxyClient {
    async fn proxies(&self) -> Result<BTreeMap<String, Proxy>, GenericError> {
        let response = self.inner.get(self.url("/proxies")).send().await?;

        let response = process_response(response).await?;
        response.json().await.error_context("Failed to decode proxy listing.")
    }

    async fn set_enabled(&self, proxy: &str, enabled: bool) -> Result<(), GenericError> {
        let url = self.url(&format!("/proxies/{}", proxy));
        let response = self.inner.post(url).json(&json!({ "enabled": enabled })).send().await?;

        let _ = process_response(response).await?;
        Ok(())
    }

    async fn toxics(&self, proxy: &str) -> Result<Vec<Toxic>, GenericError> {
        let url = self.url(&format!("/proxies/{}/toxics", proxy));
        let response = self.inner.get(url).send().await?;

        let response = process_response(response).await?;
        response
            .json()
            .await
            .with_error_context(|| format!("Failed to decode toxics of proxy '{}'.", proxy))
    }

    async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<(), GenericError> {
        let url = self.url(&format!("/proxies/{}/toxics", proxy));
        let response = self.inner.post(url).json(toxic).send().await?;

        let _ = process_response(response).await?;
        Ok(())
    }

    async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GenericError> {
        let url = self.url(&format!("/proxies/{}/toxics/{}", proxy, toxic));
        let response = self.inner.delete(url).send().await?;

        let _ = process_response(response).await?;
        Ok(())
    }
}

async fn process_response(response: reqwest::Response) -> Result<reqwest::Response, GenericError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
        Err(generic_error!("Received non-success response ({}): {}.", status, body))
    }
}
