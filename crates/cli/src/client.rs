//! API client for the Datapath Observer query server

use anyhow::{Context, Result};
use observer_lib::{AggregatedResult, LatencyMetric, PodHealthResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::QueryArgs;

/// API client for the query server
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Build the request URL for `path` with the query filters applied
    pub fn url(&self, path: &str, args: &QueryArgs) -> Result<Url> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(ns) = &args.namespace {
                query.append_pair("namespace", ns);
            }
            if let Some(n) = args.top_n {
                query.append_pair("topN", &n.to_string());
            }
            if let Some(selector) = &args.selector {
                query.append_pair("labelSelector", selector);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn latency(&self, metric: LatencyMetric, args: &QueryArgs) -> Result<AggregatedResult> {
        let url = self.url(&format!("api/v1/{}", metric.as_str()), args)?;
        self.get(url).await
    }

    pub async fn pod_health(&self, args: &QueryArgs) -> Result<PodHealthResult> {
        let url = self.url("api/v1/pod-health", args)?;
        self.get(url).await
    }
}
