//! Batched, idempotent snapshot writes.

use tracing::{debug, warn};

use crate::error::{Result, StatsError};
use crate::storage::StatsRepository;
use crate::types::{PedigreeSnapshot, StatsSnapshot};

/// A record keyed by entity id.
pub trait SnapshotRecord {
    fn entity_id(&self) -> &str;
}

impl SnapshotRecord for StatsSnapshot {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl SnapshotRecord for PedigreeSnapshot {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

/// Destination of computed snapshots.
pub trait SnapshotSink<R> {
    /// Insert or replace one record. Returns `false` when the stored record
    /// already held the same metrics.
    fn upsert_one(&self, record: &R) -> Result<bool>;

    fn begin_batch(&self) -> Result<()> {
        Ok(())
    }

    fn end_batch(&self) -> Result<()> {
        Ok(())
    }
}

impl SnapshotSink<StatsSnapshot> for StatsRepository {
    fn upsert_one(&self, record: &StatsSnapshot) -> Result<bool> {
        self.upsert_stats(record)
    }

    fn begin_batch(&self) -> Result<()> {
        self.begin()
    }

    fn end_batch(&self) -> Result<()> {
        self.commit()
    }
}

impl SnapshotSink<PedigreeSnapshot> for StatsRepository {
    fn upsert_one(&self, record: &PedigreeSnapshot) -> Result<bool> {
        self.upsert_pedigree(record)
    }

    fn begin_batch(&self) -> Result<()> {
        self.begin()
    }

    fn end_batch(&self) -> Result<()> {
        self.commit()
    }
}

/// Counts of one write pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn merge(&mut self, other: UpsertReport) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

pub struct BatchUpserter {
    batch_size: usize,
}

impl BatchUpserter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Write `records` in transactions of `batch_size`. A failing record is
    /// logged and counted; the others are still written.
    pub fn write<R, S>(&self, sink: &S, records: &[R]) -> UpsertReport
    where
        R: SnapshotRecord,
        S: SnapshotSink<R> + ?Sized,
    {
        let mut report = UpsertReport::default();

        for batch in records.chunks(self.batch_size) {
            if let Err(e) = sink.begin_batch() {
                warn!("Could not open write batch of {} records: {}", batch.len(), e);
                report.failed += batch.len();
                continue;
            }

            let mut batch_report = UpsertReport::default();
            for record in batch {
                match sink.upsert_one(record) {
                    Ok(true) => batch_report.written += 1,
                    Ok(false) => batch_report.unchanged += 1,
                    Err(e) => {
                        let err = StatsError::Write {
                            entity_id: record.entity_id().to_string(),
                            source: Box::new(e),
                        };
                        warn!("{}", err);
                        batch_report.failed += 1;
                    }
                }
            }

            match sink.end_batch() {
                Ok(()) => report.merge(batch_report),
                Err(e) => {
                    warn!("Write batch of {} records rolled back: {}", batch.len(), e);
                    report.failed += batch.len();
                }
            }
        }

        debug!(
            "Upserted {} records: {} written, {} unchanged, {} failed",
            records.len(),
            report.written,
            report.unchanged,
            report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, SnapshotSource};
    use crate::window::{summarize, DatedOutcome, Finish};
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::cell::RefCell;

    struct Record(String);

    impl SnapshotRecord for Record {
        fn entity_id(&self) -> &str {
            &self.0
        }
    }

    /// Fails on configured ids and records batch boundaries.
    #[derive(Default)]
    struct FakeSink {
        failing: Vec<String>,
        log: RefCell<Vec<String>>,
    }

    impl SnapshotSink<Record> for FakeSink {
        fn upsert_one(&self, record: &Record) -> Result<bool> {
            if self.failing.contains(&record.0) {
                return Err(StatsError::Permanent("constraint violation".to_string()));
            }
            self.log.borrow_mut().push(record.0.clone());
            Ok(!record.0.starts_with("same"))
        }

        fn begin_batch(&self) -> Result<()> {
            self.log.borrow_mut().push("begin".to_string());
            Ok(())
        }

        fn end_batch(&self) -> Result<()> {
            self.log.borrow_mut().push("end".to_string());
            Ok(())
        }
    }

    fn records(ids: &[&str]) -> Vec<Record> {
        ids.iter().map(|id| Record(id.to_string())).collect()
    }

    #[test]
    fn test_one_failure_does_not_stop_the_batch() {
        let sink = FakeSink {
            failing: vec!["b".to_string()],
            ..Default::default()
        };
        let report = BatchUpserter::new(500).write(&sink, &records(&["a", "b", "c", "same-d"]));

        assert_eq!(
            report,
            UpsertReport {
                written: 2,
                unchanged: 1,
                failed: 1
            }
        );
        assert_eq!(*sink.log.borrow(), vec!["begin", "a", "c", "same-d", "end"]);
    }

    #[test]
    fn test_batches_are_bracketed() {
        let sink = FakeSink::default();
        BatchUpserter::new(2).write(&sink, &records(&["a", "b", "c"]));
        assert_eq!(
            *sink.log.borrow(),
            vec!["begin", "a", "b", "end", "begin", "c", "end"]
        );
    }

    #[test]
    fn test_repository_rewrite_is_unchanged() {
        let repo = StatsRepository::in_memory().unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let outcomes = vec![
            DatedOutcome::new(today - Duration::days(2), Finish::Win),
            DatedOutcome::new(today - Duration::days(9), Finish::Unplaced),
        ];
        let first_at = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let snapshot =
            summarize(&outcomes, today).snapshot("j1", EntityKind::Jockey, None, first_at);
        assert_eq!(snapshot.source, SnapshotSource::Direct);

        let upserter = BatchUpserter::new(500);
        let first = upserter.write(&repo, std::slice::from_ref(&snapshot));
        assert_eq!(first.written, 1);

        let mut later = snapshot.clone();
        later.computed_at = first_at + Duration::hours(24);
        let second = upserter.write(&repo, &[later]);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.written, 0);

        let stored = repo.get_stats(EntityKind::Jockey, "j1").unwrap().unwrap();
        assert_eq!(stored.computed_at, first_at);
    }
}
