//! Batch runner: drives detection, computation, writes and checkpoints for
//! each requested kind.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::aggregator::{DirectAggregator, EntityResult};
use crate::availability::{self, SourceDecision};
use crate::checkpoint::CheckpointManager;
use crate::config::AppConfig;
use crate::error::{Result, StatsError};
use crate::external::ExternalReconstructor;
use crate::pedigree::PedigreeAggregator;
use crate::storage::{EntityRef, StatsRepository};
use crate::types::{EntityKind, SnapshotSource, StatsSnapshot};
use crate::upsert::{BatchUpserter, SnapshotRecord, SnapshotSink};

/// What one `stats` invocation should do.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub kinds: Vec<EntityKind>,
    /// Cap on entities per kind
    pub limit: Option<u64>,
    pub resume: bool,
    pub dry_run: bool,
    /// Recompute every registered entity instead of recently active ones
    pub full: bool,
    /// Stop after this many batches per kind, leaving a checkpoint
    pub max_batches: Option<u32>,
}

impl RunOptions {
    pub fn new(kinds: Vec<EntityKind>) -> Self {
        Self {
            kinds,
            limit: None,
            resume: false,
            dry_run: false,
            full: false,
            max_batches: None,
        }
    }
}

/// Outcome of one kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub kind: EntityKind,
    pub source: Option<SnapshotSource>,
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub completed: bool,
    /// Set when the kind could not run at all
    pub failure: Option<String>,
}

impl KindSummary {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            source: None,
            processed: 0,
            updated: 0,
            unchanged: 0,
            errors: 0,
            completed: false,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub kinds: Vec<KindSummary>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn has_errors(&self) -> bool {
        self.kinds
            .iter()
            .any(|k| k.errors > 0 || k.failure.is_some())
    }
}

pub struct BatchRunner<'a> {
    repo: &'a StatsRepository,
    config: &'a AppConfig,
    external: Option<ExternalReconstructor>,
    cancel: Arc<AtomicBool>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        repo: &'a StatsRepository,
        config: &'a AppConfig,
        external: Option<ExternalReconstructor>,
    ) -> Self {
        Self {
            repo,
            config,
            external,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked between batches; setting it stops the run after the
    /// batch in flight.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub async fn run(&self, options: &RunOptions, now: DateTime<Utc>) -> Result<RunReport> {
        let mut checkpoints = if options.dry_run {
            CheckpointManager::in_memory(&options.kinds)
        } else {
            CheckpointManager::acquire(
                Path::new(&self.config.engine.checkpoint_dir),
                &options.kinds,
                options.resume,
            )?
        };

        let mut report = RunReport::default();
        for &kind in &options.kinds {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }

            if checkpoints.is_completed(kind) {
                info!("{} already completed in the checkpointed run, skipping", kind);
                let mut summary = KindSummary::new(kind);
                summary.completed = true;
                report.kinds.push(summary);
                continue;
            }

            let mut summary = KindSummary::new(kind);
            if let Err(e) = self.run_kind(kind, options, now, &mut checkpoints, &mut summary).await {
                error!("{} failed: {}", kind, e);
                summary.failure = Some(e.to_string());
            }
            info!(
                "{}: processed {}, updated {}, unchanged {}, errors {}, completed {}",
                kind, summary.processed, summary.updated, summary.unchanged, summary.errors, summary.completed
            );
            report.kinds.push(summary);
        }

        report.cancelled |= self.cancelled();
        if checkpoints.release()? {
            info!("All kinds completed; checkpoints removed");
        }
        Ok(report)
    }

    async fn run_kind(
        &self,
        kind: EntityKind,
        options: &RunOptions,
        now: DateTime<Utc>,
        checkpoints: &mut CheckpointManager,
        summary: &mut KindSummary,
    ) -> Result<()> {
        let engine = &self.config.engine;

        let registered = self.repo.register_entities(kind)?;
        if registered > 0 {
            info!("Registered {} new {} entities", registered, kind);
        }

        let availability = availability::detect(self.repo, kind, engine.availability_threshold)?;
        let source = match availability.decision {
            SourceDecision::Direct => SnapshotSource::Direct,
            SourceDecision::Fallback if kind.is_pedigree() => {
                return Err(StatsError::SourceUnavailable {
                    kind,
                    reason: format!(
                        "pedigree statistics need local events; {}",
                        availability.rationale
                    ),
                });
            }
            SourceDecision::Fallback if self.external.is_none() => {
                return Err(StatsError::SourceUnavailable {
                    kind,
                    reason: "local data insufficient and no external results source configured"
                        .to_string(),
                });
            }
            SourceDecision::Fallback => SnapshotSource::Fallback,
        };
        summary.source = Some(source);

        let active_since = checkpoints.pin_horizon(
            kind,
            active_since(kind, options.full, now, engine.incremental_lookback_days),
        );
        let total = self.repo.count_entities(kind, active_since)?;
        let target = options.limit.map_or(total, |limit| limit.min(total));
        let mut offset = checkpoints.start_offset(kind);
        let mut cursor = checkpoints.cursor(kind);

        info!(
            "{}: {} entities to process, resuming after {:?} ({})",
            kind,
            target,
            cursor,
            match active_since {
                Some(date) => format!("active since {}", date),
                None => "full".to_string(),
            }
        );

        let pedigree = if kind.is_pedigree() {
            Some(PedigreeAggregator::new(self.repo, engine.chunk_size)?)
        } else {
            None
        };
        let upserter = BatchUpserter::new(engine.upsert_batch_size);
        let mut batches = 0u32;

        loop {
            let remaining = options.limit.map_or(u64::MAX, |limit| limit.saturating_sub(offset));
            if remaining == 0 {
                break;
            }
            if self.cancelled() {
                warn!("{}: cancelled at offset {}", kind, offset);
                return Ok(());
            }
            if options.max_batches.is_some_and(|max| batches >= max) {
                info!("{}: stopping after {} batches at offset {}", kind, batches, offset);
                return Ok(());
            }

            let size = remaining.min(engine.batch_size.max(1) as u64) as usize;
            let entities = self
                .repo
                .list_entities(kind, active_since, size, cursor.as_deref())?;
            let Some(last) = entities.last().map(|e| e.id.clone()) else {
                break;
            };

            if let Some(pedigree) = &pedigree {
                let results = pedigree.compute(kind, &entities, now);
                self.write_results(&upserter, results, options.dry_run, summary);
            } else {
                let results = self.compute_stats(kind, source, &entities, now).await?;
                self.write_results(&upserter, results, options.dry_run, summary);
            }

            offset += entities.len() as u64;
            checkpoints.commit_batch(kind, offset, &last)?;
            cursor = Some(last);
            batches += 1;
            info!("{}: {}/{} entities processed", kind, offset, target);
            if entities.len() < size {
                break;
            }
        }

        checkpoints.mark_completed(kind)?;
        summary.completed = true;
        Ok(())
    }

    async fn compute_stats(
        &self,
        kind: EntityKind,
        source: SnapshotSource,
        entities: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityResult<StatsSnapshot>>> {
        match (source, &self.external) {
            (SnapshotSource::Fallback, Some(external)) => Ok(external.compute(kind, entities, now).await),
            _ => DirectAggregator::new(self.repo, self.config.engine.chunk_size).compute(kind, entities, now),
        }
    }

    fn write_results<R>(
        &self,
        upserter: &BatchUpserter,
        results: Vec<EntityResult<R>>,
        dry_run: bool,
        summary: &mut KindSummary,
    ) where
        R: SnapshotRecord,
        StatsRepository: SnapshotSink<R>,
    {
        let mut records = Vec::with_capacity(results.len());
        for (entity_id, result) in results {
            summary.processed += 1;
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping {}: {}", entity_id, e);
                    summary.errors += 1;
                }
            }
        }

        if dry_run {
            return;
        }
        let written = upserter.write(self.repo, &records);
        summary.updated += written.written;
        summary.unchanged += written.unchanged;
        summary.errors += written.failed;
    }
}

/// Activity horizon of an incremental run; ancestor tiers always process
/// every registered ancestor.
fn active_since(kind: EntityKind, full: bool, now: DateTime<Utc>, lookback_days: i64) -> Option<NaiveDate> {
    if full || kind.is_pedigree() {
        None
    } else {
        Some(now.date_naive() - Duration::days(lookback_days))
    }
}
