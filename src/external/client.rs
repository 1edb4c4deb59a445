//! HTTP client for the external per-entity results API.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ExternalConfig;
use crate::error::{Result, StatsError};
use crate::types::EntityKind;
use crate::window::RankValue;

/// One race result as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalResult {
    pub race_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub position: Option<RankValue>,
    #[serde(default)]
    pub prize: Option<i64>,
    #[serde(default)]
    pub race_class: Option<String>,
    #[serde(default)]
    pub distance: Option<u32>,
}

/// One page of results.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsPage {
    pub results: Vec<ExternalResult>,
    /// Number of the next page, absent on the last page
    #[serde(default)]
    pub next_page: Option<u32>,
}

/// Paginated per-entity results keyed by entity id and date range.
#[async_trait]
pub trait ResultsSource: Send + Sync {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        page: u32,
    ) -> Result<ResultsPage>;
}

/// `reqwest`-backed results source with bearer authentication.
pub struct HttpResultsSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
}

impl HttpResultsSource {
    /// Build the client, or `None` when no base URL is configured.
    pub fn from_config(config: &ExternalConfig) -> Result<Option<Self>> {
        let Some(base_url) = config.base_url.as_ref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StatsError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size,
        }))
    }

    fn results_url(&self, kind: EntityKind, entity_id: &str) -> String {
        format!(
            "{}/{}/{}/results",
            self.base_url,
            kind.profile().api_segment,
            entity_id
        )
    }
}

fn classify_status(status: StatusCode, url: &str) -> StatsError {
    let message = format!("{} returned {}", url, status);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatsError::Transient(message)
    } else {
        StatsError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> StatsError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StatsError::Transient(err.to_string())
    } else {
        StatsError::Permanent(err.to_string())
    }
}

#[async_trait]
impl ResultsSource for HttpResultsSource {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        page: u32,
    ) -> Result<ResultsPage> {
        let url = self.results_url(kind, entity_id);
        let mut request = self.client.get(&url).query(&[
            ("from", from.to_string()),
            ("to", to.to_string()),
            ("page", page.to_string()),
            ("per_page", self.page_size.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }

        response
            .json::<ResultsPage>()
            .await
            .map_err(|e| StatsError::Permanent(format!("invalid results page from {}: {}", url, e)))
    }
}
