//! Rebuild bounded snapshots from the external results source when the
//! local event store is too thin.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use super::client::{ExternalResult, ResultsSource};
use super::rate_limiter::RateLimiter;
use crate::aggregator::EntityResult;
use crate::config::ExternalConfig;
use crate::error::{Result, StatsError};
use crate::retry::{retry, Backoff};
use crate::storage::EntityRef;
use crate::types::{EntityKind, StatsSnapshot};
use crate::window::{summarize, DatedOutcome, Finish};

/// Fallback snapshot builder.
pub struct ExternalReconstructor {
    source: Box<dyn ResultsSource>,
    limiter: RateLimiter,
    retry: Backoff,
    lookback_days: i64,
    max_pages: u32,
}

impl ExternalReconstructor {
    pub fn new(source: Box<dyn ResultsSource>, config: &ExternalConfig) -> Self {
        Self {
            source,
            limiter: RateLimiter::new(config.requests_per_second),
            retry: config.retry.to_backoff(),
            lookback_days: config.lookback_days,
            max_pages: config.max_pages,
        }
    }

    /// One snapshot per entity, in input order. Fetch failures are reported
    /// per entity and never abort the batch.
    pub async fn compute(
        &self,
        kind: EntityKind,
        entities: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Vec<EntityResult<StatsSnapshot>> {
        let today = now.date_naive();
        let mut results = Vec::with_capacity(entities.len());

        for entity in entities {
            let snapshot = match self.fetch_all(kind, &entity.id, today).await {
                Ok(fetched) => Ok(summarize(&to_outcomes(&fetched), today).bounded_snapshot(
                    &entity.id,
                    kind,
                    entity.name.clone(),
                    now,
                )),
                Err(e) => {
                    warn!("External results for {} {} unavailable: {}", kind, entity.id, e);
                    Err(StatsError::record(&entity.id, e))
                }
            };
            results.push((entity.id.clone(), snapshot));
        }

        results
    }

    async fn fetch_all(
        &self,
        kind: EntityKind,
        entity_id: &str,
        today: NaiveDate,
    ) -> Result<Vec<ExternalResult>> {
        let from = today - Duration::days(self.lookback_days);
        let mut fetched = Vec::new();
        let mut page = 1;

        for _ in 0..self.max_pages {
            let operation = format!("fetch {} {} page {}", kind, entity_id, page);
            let response = retry(&self.retry, &operation, StatsError::is_transient, || async move {
                self.limiter.acquire().await;
                self.source.fetch_page(kind, entity_id, from, today, page).await
            })
            .await?;

            fetched.extend(response.results);
            match response.next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(fetched),
            }
        }

        debug!(
            "Stopped paging {} {} after {} pages",
            kind, entity_id, self.max_pages
        );
        Ok(fetched)
    }
}

fn to_outcomes(results: &[ExternalResult]) -> Vec<DatedOutcome> {
    results
        .iter()
        .filter_map(|r| {
            Finish::from_optional(r.position.as_ref()).map(|finish| DatedOutcome {
                date: r.date,
                finish,
                prize: r.prize,
            })
        })
        .collect()
}
