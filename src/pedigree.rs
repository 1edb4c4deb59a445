//! Ancestor statistics aggregated over descendants.
//!
//! Sires and dams are joined to the races of their offspring; damsires are
//! joined through their daughters to the races of the grandoffspring.
//! Class and distance breakdowns carry an A/E index: actual wins against
//! the wins expected from each race's class-wide win rate.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::aggregator::{load_events, parse_race_date, to_outcomes, EntityResult};
use crate::error::Result;
use crate::storage::{EntityRef, EventRow, StatsRepository};
use crate::types::{BreakdownEntry, EntityKind, PedigreeSnapshot, StatsSnapshot};
use crate::window::{rate, round2, summarize, Finish};

/// Breakdown rows kept per snapshot.
const TOP_BUCKETS: usize = 3;

const UNKNOWN_CLASS: &str = "unknown";

fn class_label(class: Option<&str>) -> String {
    match class.map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => UNKNOWN_CLASS.to_string(),
    }
}

/// Rank of a race class, lower is better. Unrecognised classes share the
/// last rank.
pub fn class_rank(class: &str) -> u8 {
    let normalized: String = class
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    match normalized.as_str() {
        "G1" | "GI" | "GRADE1" | "JPN1" => 0,
        "G2" | "GII" | "GRADE2" | "JPN2" => 1,
        "G3" | "GIII" | "GRADE3" | "JPN3" => 2,
        "L" | "LISTED" => 3,
        "OP" | "OPEN" => 4,
        _ => 5,
    }
}

/// Distance bucket of a race in metres.
pub fn distance_bucket(distance: u32) -> &'static str {
    match distance {
        0..=1399 => "sprint",
        1400..=1799 => "mile",
        1800..=2199 => "intermediate",
        2200..=2799 => "long",
        _ => "extended",
    }
}

/// Population win rate of every race class, as a fraction.
#[derive(Debug, Clone, Default)]
pub struct ClassBaseline {
    rates: HashMap<String, f64>,
}

impl ClassBaseline {
    /// Scan every resulted event once.
    pub fn load(repo: &StatsRepository) -> Result<Self> {
        let mut counts: HashMap<String, (u32, u32)> = HashMap::new();
        repo.for_each_class_result(|class, rank| {
            let Some(finish) = Finish::from_optional(rank.as_ref()) else {
                return;
            };
            let entry = counts.entry(class_label(class.as_deref())).or_default();
            entry.0 += 1;
            if finish.is_win() {
                entry.1 += 1;
            }
        })?;

        let rates = counts
            .into_iter()
            .map(|(class, (runs, wins))| (class, wins as f64 / runs as f64))
            .collect();
        Ok(Self { rates })
    }

    /// Expected wins of a single run in `class`.
    pub fn expected_win(&self, class: &str) -> f64 {
        self.rates.get(class).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    runs: u32,
    wins: u32,
    expected: f64,
}

impl Bucket {
    fn add(&mut self, won: bool, expected: f64) {
        self.runs += 1;
        if won {
            self.wins += 1;
        }
        self.expected += expected;
    }
}

fn ae_index(wins: u32, expected: f64) -> Option<f64> {
    if expected > 0.0 {
        Some(round2(wins as f64 / expected * 100.0))
    } else {
        None
    }
}

/// Top buckets ordered by wins desc, runs desc, label asc.
fn top_breakdown(buckets: HashMap<String, Bucket>) -> Vec<BreakdownEntry> {
    let mut entries: Vec<BreakdownEntry> = buckets
        .into_iter()
        .map(|(label, b)| BreakdownEntry {
            label,
            runs: b.runs,
            wins: b.wins,
            win_percent: rate(b.wins, b.runs),
            ae_index: ae_index(b.wins, b.expected),
        })
        .collect();
    entries.sort_by(|a, b| {
        b.wins
            .cmp(&a.wins)
            .then(b.runs.cmp(&a.runs))
            .then_with(|| a.label.cmp(&b.label))
    });
    entries.truncate(TOP_BUCKETS);
    entries
}

fn per_descendant(total: u32, descendants: u32) -> Option<f64> {
    if descendants == 0 {
        None
    } else {
        Some(round2(total as f64 / descendants as f64))
    }
}

pub struct PedigreeAggregator<'a> {
    repo: &'a StatsRepository,
    chunk_size: usize,
    baseline: ClassBaseline,
}

impl<'a> PedigreeAggregator<'a> {
    /// Build the aggregator, loading the class baseline once.
    pub fn new(repo: &'a StatsRepository, chunk_size: usize) -> Result<Self> {
        let baseline = ClassBaseline::load(repo)?;
        Ok(Self::with_baseline(repo, chunk_size, baseline))
    }

    pub fn with_baseline(repo: &'a StatsRepository, chunk_size: usize, baseline: ClassBaseline) -> Self {
        Self {
            repo,
            chunk_size,
            baseline,
        }
    }

    /// One snapshot per ancestor, in input order.
    pub fn compute(
        &self,
        kind: EntityKind,
        ancestors: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Vec<EntityResult<PedigreeSnapshot>> {
        ancestors
            .iter()
            .map(|ancestor| (ancestor.id.clone(), self.compute_one(kind, ancestor, now)))
            .collect()
    }

    fn compute_one(
        &self,
        kind: EntityKind,
        ancestor: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<PedigreeSnapshot> {
        let horse_column = EntityKind::Horse.profile().role_column;
        let own_career = self.own_career(ancestor, now)?;

        let descendants = self.repo.descendants(kind, &ancestor.id)?;
        let events = load_events(self.repo, horse_column, &descendants, self.chunk_size)?;
        debug!(
            "{} {}: {} descendants, {} with events",
            kind,
            ancestor.id,
            descendants.len(),
            events.len()
        );

        let mut snapshot = PedigreeSnapshot {
            entity_id: ancestor.id.clone(),
            kind,
            name: ancestor.name.clone(),
            own_career,
            descendant_count: descendants.len() as u32,
            descendant_runs: 0,
            descendant_wins: 0,
            descendant_places: 0,
            descendant_prize: 0,
            descendant_win_rate: None,
            descendant_place_rate: None,
            avg_runs_per_descendant: None,
            avg_wins_per_descendant: None,
            best_class: None,
            class_breakdown: Vec::new(),
            distance_breakdown: Vec::new(),
            computed_at: now,
        };

        let mut by_class: HashMap<String, Bucket> = HashMap::new();
        let mut by_distance: HashMap<String, Bucket> = HashMap::new();
        let mut best: Option<(u8, String)> = None;

        for event in descendants.iter().flat_map(|id| events.get(id).into_iter().flatten()) {
            let Some(finish) = Finish::from_optional(event.rank.as_ref()) else {
                continue;
            };
            parse_race_date(&event.entity_id, &event.race_date)?;
            self.count_event(&mut snapshot, event, finish);

            let class = class_label(event.race_class.as_deref());
            let expected = self.baseline.expected_win(&class);
            if let Some(distance) = event.distance {
                by_distance
                    .entry(distance_bucket(distance).to_string())
                    .or_default()
                    .add(finish.is_win(), expected);
            }
            if finish.is_win() {
                let candidate = (class_rank(&class), class.clone());
                if best.as_ref().map_or(true, |current| candidate < *current) {
                    best = Some(candidate);
                }
            }
            by_class.entry(class).or_default().add(finish.is_win(), expected);
        }

        snapshot.descendant_win_rate = rate(snapshot.descendant_wins, snapshot.descendant_runs);
        snapshot.descendant_place_rate = rate(snapshot.descendant_places, snapshot.descendant_runs);
        snapshot.avg_runs_per_descendant = per_descendant(snapshot.descendant_runs, snapshot.descendant_count);
        snapshot.avg_wins_per_descendant = per_descendant(snapshot.descendant_wins, snapshot.descendant_count);
        snapshot.best_class = best.map(|(_, label)| label);
        snapshot.class_breakdown = top_breakdown(by_class);
        snapshot.distance_breakdown = top_breakdown(by_distance);

        Ok(snapshot)
    }

    fn count_event(&self, snapshot: &mut PedigreeSnapshot, event: &EventRow, finish: Finish) {
        snapshot.descendant_runs += 1;
        if finish.is_win() {
            snapshot.descendant_wins += 1;
        }
        if finish.is_place() {
            snapshot.descendant_places += 1;
        }
        snapshot.descendant_prize += event.prize.unwrap_or(0);
    }

    /// The ancestor's own racing record, if it ever ran.
    fn own_career(&self, ancestor: &EntityRef, now: DateTime<Utc>) -> Result<Option<StatsSnapshot>> {
        let horse_column = EntityKind::Horse.profile().role_column;
        let ids = [ancestor.id.clone()];
        let events = self.repo.events_for(horse_column, &ids)?;
        let outcomes = to_outcomes(&ancestor.id, &events)?;
        if outcomes.is_empty() {
            return Ok(None);
        }
        Ok(Some(summarize(&outcomes, now.date_naive()).snapshot(
            &ancestor.id,
            EntityKind::Horse,
            ancestor.name.clone(),
            now,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::test_support::{entry, race};
    use crate::window::RankValue;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn day(n: i64) -> NaiveDate {
        now().date_naive() - Duration::days(n)
    }

    fn ancestor(id: &str) -> EntityRef {
        EntityRef {
            id: id.to_string(),
            name: Some(format!("Ancestor {}", id)),
        }
    }

    #[test]
    fn test_distance_buckets() {
        assert_eq!(distance_bucket(1200), "sprint");
        assert_eq!(distance_bucket(1399), "sprint");
        assert_eq!(distance_bucket(1400), "mile");
        assert_eq!(distance_bucket(1800), "intermediate");
        assert_eq!(distance_bucket(2200), "long");
        assert_eq!(distance_bucket(2799), "long");
        assert_eq!(distance_bucket(2800), "extended");
    }

    #[test]
    fn test_class_rank_order() {
        assert!(class_rank("G1") < class_rank("G2"));
        assert!(class_rank("G-2") < class_rank("G3"));
        assert!(class_rank("G3") < class_rank("Listed"));
        assert!(class_rank("L") < class_rank("OP"));
        assert!(class_rank("OP") < class_rank("3勝クラス"));
        assert_eq!(class_rank("maiden"), class_rank("unknown"));
    }

    #[test]
    fn test_damsire_with_unraced_grandoffspring() {
        let repo = StatsRepository::in_memory().unwrap();
        for dam in ["dam1", "dam2"] {
            repo.insert_pedigree(dam, Some("D"), None).unwrap();
            for i in 0..3 {
                repo.insert_pedigree(&format!("{}-foal{}", dam, i), Some("S"), Some(dam))
                    .unwrap();
            }
        }

        let aggregator = PedigreeAggregator::new(&repo, 1000).unwrap();
        let results = aggregator.compute(EntityKind::Damsire, &[ancestor("D")], now());
        let snapshot = results[0].1.as_ref().unwrap();

        assert_eq!(snapshot.descendant_count, 6);
        assert_eq!(snapshot.descendant_runs, 0);
        assert_eq!(snapshot.descendant_wins, 0);
        assert_eq!(snapshot.descendant_places, 0);
        assert_eq!(snapshot.descendant_prize, 0);
        assert_eq!(snapshot.descendant_win_rate, None);
        assert_eq!(snapshot.descendant_place_rate, None);
        assert_eq!(snapshot.avg_runs_per_descendant, Some(0.0));
        assert_eq!(snapshot.avg_wins_per_descendant, Some(0.0));
        assert_eq!(snapshot.best_class, None);
        assert!(snapshot.class_breakdown.is_empty());
        assert!(snapshot.distance_breakdown.is_empty());
        assert!(snapshot.own_career.is_none());
    }

    #[test]
    fn test_ancestor_without_descendants() {
        let repo = StatsRepository::in_memory().unwrap();
        let aggregator = PedigreeAggregator::new(&repo, 1000).unwrap();
        let results = aggregator.compute(EntityKind::Sire, &[ancestor("lonely")], now());
        let snapshot = results[0].1.as_ref().unwrap();

        assert_eq!(snapshot.descendant_count, 0);
        assert_eq!(snapshot.avg_runs_per_descendant, None);
        assert_eq!(snapshot.avg_wins_per_descendant, None);
    }

    /// Sire S with foals f1, f2. Background runners set class baselines:
    /// G1 wins 1 in 4, OP wins 1 in 2.
    fn seed_sire(repo: &StatsRepository) {
        repo.insert_pedigree("f1", Some("S"), Some("m1")).unwrap();
        repo.insert_pedigree("f2", Some("S"), Some("m2")).unwrap();

        race(repo, "g1a", day(30), "G1", 2400);
        entry(repo, "g1a", "f1", "j1", Some(RankValue::Int(1)));
        entry(repo, "g1a", "x1", "j2", Some(RankValue::Int(5)));
        race(repo, "g1b", day(20), "G1", 2000);
        entry(repo, "g1b", "f2", "j1", Some(RankValue::Int(3)));
        entry(repo, "g1b", "x2", "j2", Some(RankValue::Int(6)));

        race(repo, "op1", day(10), "OP", 1200);
        entry(repo, "op1", "f2", "j1", Some(RankValue::Int(1)));
        entry(repo, "op1", "x1", "j2", Some(RankValue::Int(2)));
        race(repo, "op2", day(5), "OP", 1600);
        entry(repo, "op2", "f1", "j1", Some(RankValue::Text("中止".to_string())));
        entry(repo, "op2", "x2", "j2", Some(RankValue::Int(1)));

        // Scratched runs never count
        race(repo, "op3", day(2), "OP", 1600);
        entry(repo, "op3", "f1", "j1", Some(RankValue::Text("取消".to_string())));
    }

    #[test]
    fn test_descendant_aggregates_and_ae() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_sire(&repo);

        let aggregator = PedigreeAggregator::new(&repo, 1).unwrap();
        let results = aggregator.compute(EntityKind::Sire, &[ancestor("S")], now());
        let snapshot = results[0].1.as_ref().unwrap();

        assert_eq!(snapshot.descendant_count, 2);
        assert_eq!(snapshot.descendant_runs, 4);
        assert_eq!(snapshot.descendant_wins, 2);
        assert_eq!(snapshot.descendant_places, 3);
        assert_eq!(snapshot.descendant_prize, 4000);
        assert_eq!(snapshot.descendant_win_rate, Some(50.0));
        assert_eq!(snapshot.descendant_place_rate, Some(75.0));
        assert_eq!(snapshot.avg_runs_per_descendant, Some(2.0));
        assert_eq!(snapshot.avg_wins_per_descendant, Some(1.0));
        assert_eq!(snapshot.best_class.as_deref(), Some("G1"));

        // G1: 2 runs at 0.25 expected each, 1 win => 200.00
        // OP: 2 runs at 0.5 expected each, 1 win => 100.00
        let labels: Vec<&str> = snapshot.class_breakdown.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["G1", "OP"]);
        assert_eq!(snapshot.class_breakdown[0].ae_index, Some(200.0));
        assert_eq!(snapshot.class_breakdown[0].win_percent, Some(50.0));
        assert_eq!(snapshot.class_breakdown[1].ae_index, Some(100.0));

        // sprint: 1 OP win; long: 1 G1 win; intermediate: 1 G1 run; mile: 1 OP run
        let distance: Vec<(&str, u32, u32)> = snapshot
            .distance_breakdown
            .iter()
            .map(|b| (b.label.as_str(), b.runs, b.wins))
            .collect();
        assert_eq!(
            distance,
            vec![("long", 1, 1), ("sprint", 1, 1), ("intermediate", 1, 0)]
        );
        assert_eq!(snapshot.distance_breakdown[0].ae_index, Some(400.0));
        assert_eq!(snapshot.distance_breakdown[1].ae_index, Some(200.0));
    }

    #[test]
    fn test_ae_is_null_without_expectation() {
        assert_eq!(ae_index(0, 0.0), None);
        assert_eq!(ae_index(2, 0.5), Some(400.0));
    }

    #[test]
    fn test_own_career_when_ancestor_raced() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_sire(&repo);
        race(&repo, "old", day(3000), "G1", 2400);
        entry(&repo, "old", "S", "j9", Some(RankValue::Int(1)));

        let aggregator = PedigreeAggregator::new(&repo, 1000).unwrap();
        let results = aggregator.compute(EntityKind::Sire, &[ancestor("S")], now());
        let own = results[0].1.as_ref().unwrap().own_career.as_ref().unwrap();
        assert_eq!(own.total_runs, Some(1));
        assert_eq!(own.total_wins, Some(1));
        assert_eq!(own.recent_30d_runs, 0);
    }

    #[test]
    fn test_breakdown_tie_order() {
        let mut buckets = HashMap::new();
        buckets.insert("b".to_string(), Bucket { runs: 3, wins: 1, expected: 0.0 });
        buckets.insert("a".to_string(), Bucket { runs: 3, wins: 1, expected: 0.0 });
        buckets.insert("c".to_string(), Bucket { runs: 5, wins: 1, expected: 0.0 });
        buckets.insert("d".to_string(), Bucket { runs: 1, wins: 2, expected: 0.0 });
        let labels: Vec<String> = top_breakdown(buckets).into_iter().map(|b| b.label).collect();
        assert_eq!(labels, vec!["d", "c", "a"]);
    }
}
