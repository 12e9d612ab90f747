//! Azure AI Search REST backend for the `search` tool.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use voicelive_session::tools::{SearchBackend, SearchDocument, SearchOptions};

use crate::config::SearchConfig;

pub const SEARCH_API_VERSION: &str = "2023-11-01";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    search: &'a str,
    top: usize,
    query_type: &'a str,
    semantic_configuration: &'a str,
    select: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<SearchDocument>,
}

pub struct AzureSearchBackend {
    http: reqwest::Client,
    url: Url,
    api_key: String,
}

impl AzureSearchBackend {
    pub fn new(endpoint: &str, index: &str, api_key: &str) -> Result<Self> {
        if index.trim().is_empty() {
            bail!("Search index name must not be empty");
        }
        let mut url = Url::parse(endpoint.trim())
            .with_context(|| format!("Invalid search endpoint '{}'", endpoint))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Search endpoint '{}' cannot be a base URL", endpoint))?
            .pop_if_empty()
            .extend(["indexes", index.trim(), "docs", "search"]);
        url.query_pairs_mut()
            .append_pair("api-version", SEARCH_API_VERSION);

        Ok(Self {
            http: reqwest::Client::new(),
            url,
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(&config.endpoint, &config.index, &config.api_key)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SearchBackend for AzureSearchBackend {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchDocument>> {
        let body = SearchRequest {
            search: query,
            top: options.top,
            query_type: &options.query_type,
            semantic_configuration: &options.semantic_configuration,
            select: options.select.join(","),
        };

        let response = self
            .http
            .post(self.url.clone())
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Search request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("Search service returned {}: {}", status, detail.trim());
        }

        let results: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        debug!(query, hits = results.value.len(), "Search completed");
        Ok(results.value)
    }
}
