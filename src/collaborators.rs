//! Contracts with the external analysis and consolidation services.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CollaboratorConfig;
use crate::error::{AnalysisError, PipelineError, Result};
use crate::types::{AnalysisResult, ConsolidatedInsight, InsightSource, WorkItem};

/// Per-item analysis. Implementations must be safe to call again for the same
/// item and must tell retryable failures apart from permanent ones.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, item: &WorkItem) -> std::result::Result<AnalysisResult, AnalysisError>;

    fn name(&self) -> &str;
}

/// Optional consolidation of many results into one insight
#[async_trait]
pub trait Consolidator: Send + Sync {
    async fn consolidate(&self, results: &[AnalysisResult]) -> Result<ConsolidatedInsight>;

    fn name(&self) -> &str;
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Analyzer behind `POST {base_url}/analyze`
pub struct HttpAnalyzer {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAnalyzer {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| PipelineError::Config("analyzer.base_url is not set".to_string()))?;
        let url = endpoint(base_url, "analyze");
        info!("Using HTTP analyzer at {}", url);
        Ok(Self {
            url,
            api_key: config.api_key.clone(),
            client: build_client(config.request_timeout_secs)?,
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, item: &WorkItem) -> std::result::Result<AnalysisResult, AnalysisError> {
        let mut request = self.client.post(&self.url).json(item);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::from_status(status.as_u16(), &body));
        }

        let mut result: AnalysisResult = response.json().await.map_err(|e| {
            AnalysisError::NonRetryable(format!("undecodable analysis for {}: {}", item.id, e))
        })?;
        if result.item_id.is_empty() {
            result.item_id = item.id.clone();
        }
        debug!(item = %item.id, "Analysis received");
        Ok(result)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Consolidator behind `POST {base_url}/consolidate`
pub struct HttpConsolidator {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpConsolidator {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            url: endpoint(base_url, "consolidate"),
            api_key,
            client: build_client(timeout_secs)?,
        })
    }
}

#[async_trait]
impl Consolidator for HttpConsolidator {
    async fn consolidate(&self, results: &[AnalysisResult]) -> Result<ConsolidatedInsight> {
        let mut request = self.client.post(&self.url).json(results);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let unavailable = |e: reqwest::Error| PipelineError::ConsolidationUnavailable(e.to_string());
        let mut insight: ConsolidatedInsight = request
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        insight.source = InsightSource::Collaborator;
        Ok(insight)
    }

    fn name(&self) -> &str {
        "http"
    }
}
