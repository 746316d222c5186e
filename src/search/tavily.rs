use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{SearchHit, SearchProvider};
use crate::config::{RequestConfig, SearchConfig};
use crate::error::{SearchError, SearchResult};

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u32,
    include_raw_content: bool,
    topic: &'a str,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    score: f64,
}

impl From<TavilyResult> for SearchHit {
    fn from(r: TavilyResult) -> Self {
        Self {
            title: r.title,
            url: r.url,
            content: r.content,
            raw_content: r.raw_content,
            score: r.score,
        }
    }
}

/// Client for the Tavily search API
#[derive(Clone)]
pub struct TavilyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl TavilyClient {
    /// Create a new Tavily client
    pub fn new(config: &SearchConfig, request_config: &RequestConfig) -> SearchResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(|e| SearchError::Request {
                query: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &str, max_results: u32) -> SearchResult<Vec<SearchHit>> {
        let start = Instant::now();
        let url = format!("{}/search", self.base_url);

        debug!(query = %query, max_results, "Calling Tavily search");

        let response = self
            .client
            .post(&url)
            .json(&TavilyRequest {
                api_key: &self.api_key,
                query,
                max_results,
                include_raw_content: true,
                topic: "general",
            })
            .send()
            .await
            .map_err(|e| SearchError::Request {
                query: query.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: TavilyResponse =
            response
                .json()
                .await
                .map_err(|e| SearchError::InvalidResponse {
                    message: format!("Failed to parse search response: {}", e),
                })?;

        let hits: Vec<SearchHit> = parsed
            .results
            .into_iter()
            .take(max_results as usize)
            .map(SearchHit::from)
            .collect();

        info!(
            query = %query,
            results = hits.len(),
            latency_ms = start.elapsed().as_millis(),
            "Search completed"
        );

        Ok(hits)
    }
}
