//! Combined records of entities that appear in the same entry.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::Result;
use crate::storage::StatsRepository;
use crate::types::{PairKind, PairStats};
use crate::window::{rate, Finish};

#[derive(Debug, Default)]
struct PairCounts {
    runs: u32,
    wins: u32,
    seconds: u32,
    thirds: u32,
}

/// Result of one analysis pass.
#[derive(Debug, Clone)]
pub struct PairReport {
    pub kind: PairKind,
    /// Distinct pairs seen before filtering
    pub candidates: usize,
    pub pairs: Vec<PairStats>,
    /// Rows stored, `None` on a dry run
    pub stored: Option<usize>,
}

pub struct PairAnalyzer<'a> {
    repo: &'a StatsRepository,
    min_samples: u32,
}

impl<'a> PairAnalyzer<'a> {
    pub fn new(repo: &'a StatsRepository, min_samples: u32) -> Self {
        Self { repo, min_samples }
    }

    /// Group every resulted event by its ordered pair and keep pairs with at
    /// least `min_samples` runs, ordered by (first, second).
    pub fn analyze(&self, kind: PairKind, now: DateTime<Utc>) -> Result<(usize, Vec<PairStats>)> {
        let mut grouped: BTreeMap<(String, String), PairCounts> = BTreeMap::new();
        self.repo.for_each_pair_event(kind, |first, second, rank| {
            let Some(finish) = Finish::from_optional(rank.as_ref()) else {
                return;
            };
            let counts = grouped.entry((first, second)).or_default();
            counts.runs += 1;
            match finish {
                Finish::Win => counts.wins += 1,
                Finish::Second => counts.seconds += 1,
                Finish::Third => counts.thirds += 1,
                Finish::Unplaced | Finish::NonFinish => {}
            }
        })?;

        let candidates = grouped.len();
        let pairs = grouped
            .into_iter()
            .filter(|(_, c)| c.runs >= self.min_samples)
            .map(|((first_id, second_id), c)| PairStats {
                pair_kind: kind,
                first_id,
                second_id,
                runs: c.runs,
                wins: c.wins,
                seconds: c.seconds,
                thirds: c.thirds,
                win_percent: rate(c.wins, c.runs),
                place_percent: rate(c.wins + c.seconds + c.thirds, c.runs),
                computed_at: now,
            })
            .collect();

        Ok((candidates, pairs))
    }

    /// Analyze and, unless `dry_run`, replace the stored pairs of `kind`.
    pub fn run(&self, kind: PairKind, dry_run: bool, now: DateTime<Utc>) -> Result<PairReport> {
        let (candidates, pairs) = self.analyze(kind, now)?;
        let stored = if dry_run {
            None
        } else {
            Some(self.repo.replace_pairs(kind, &pairs)?)
        };

        info!(
            "{}: {} of {} pairs have at least {} runs{}",
            kind,
            pairs.len(),
            candidates,
            self.min_samples,
            if dry_run { " (dry run)" } else { "" }
        );

        Ok(PairReport {
            kind,
            candidates,
            pairs,
            stored,
        })
    }
}
