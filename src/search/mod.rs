//! Web search collaborator.
//!
//! The workflow only depends on [`SearchProvider`]; [`TavilyClient`] is the
//! production implementation.

mod tavily;

pub use tavily::TavilyClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SearchResult;

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    /// Canonical URL, the deduplication key.
    pub url: String,
    /// Most relevant snippet.
    pub content: String,
    /// Full page text when the provider returns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub score: f64,
}

/// Executes one search query. Per-query timeouts are the provider's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run `query`, returning at most `max_results` hits.
    async fn search(&self, query: &str, max_results: u32) -> SearchResult<Vec<SearchHit>>;
}
