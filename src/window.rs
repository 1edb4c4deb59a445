//! Trailing-window and lifetime statistics over dated race outcomes.
//!
//! This is the single place that decides what a rank means and how rates
//! are rounded; every aggregator goes through it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::types::{EntityKind, SnapshotSource, StatsSnapshot};

/// Short recency window in days.
pub const RECENT_SHORT_DAYS: i64 = 14;
/// Long recency window in days.
pub const RECENT_LONG_DAYS: i64 = 30;

/// Finishing rank as it arrives from a store or an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankValue {
    Int(i64),
    Text(String),
}

impl From<i64> for RankValue {
    fn from(n: i64) -> Self {
        RankValue::Int(n)
    }
}

impl From<&str> for RankValue {
    fn from(s: &str) -> Self {
        RankValue::Text(s.to_string())
    }
}

/// Normalized race outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finish {
    Win,
    Second,
    Third,
    Unplaced,
    NonFinish,
}

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(st|nd|rd|th|着)?$").unwrap())
}

/// Codes for runners that never started; those entries are not runs.
const NON_STARTER_CODES: [&str; 7] = ["scr", "scratched", "wd", "withdrawn", "ns", "取消", "除外"];

const WIN_CODES: [&str; 4] = ["won", "win", "w", "first"];
const SECOND_CODES: [&str; 1] = ["second"];
const THIRD_CODES: [&str; 1] = ["third"];

impl Finish {
    /// Normalize a rank. `None` means the entry does not count as a run
    /// (no result yet, or the runner was withdrawn).
    pub fn from_rank(rank: &RankValue) -> Option<Finish> {
        match rank {
            RankValue::Int(n) => Some(Self::from_position(*n)),
            RankValue::Text(text) => Self::from_text(text),
        }
    }

    /// Normalize an optional rank; a null rank is "not resulted".
    pub fn from_optional(rank: Option<&RankValue>) -> Option<Finish> {
        rank.and_then(Self::from_rank)
    }

    fn from_position(n: i64) -> Finish {
        match n {
            1 => Finish::Win,
            2 => Finish::Second,
            3 => Finish::Third,
            n if n > 3 => Finish::Unplaced,
            _ => Finish::NonFinish,
        }
    }

    fn from_text(text: &str) -> Option<Finish> {
        let cleaned: String = text
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        if cleaned.is_empty() || NON_STARTER_CODES.contains(&cleaned.as_str()) {
            return None;
        }
        if WIN_CODES.contains(&cleaned.as_str()) {
            return Some(Finish::Win);
        }
        if SECOND_CODES.contains(&cleaned.as_str()) {
            return Some(Finish::Second);
        }
        if THIRD_CODES.contains(&cleaned.as_str()) {
            return Some(Finish::Third);
        }
        if let Some(caps) = ordinal_re().captures(&cleaned) {
            if let Ok(n) = caps[1].parse::<i64>() {
                return Some(Self::from_position(n));
            }
        }
        // DNF, PU, F, UR, 中止, 失格, ...
        Some(Finish::NonFinish)
    }

    pub fn is_win(&self) -> bool {
        matches!(self, Finish::Win)
    }

    /// Top three, wins included.
    pub fn is_place(&self) -> bool {
        matches!(self, Finish::Win | Finish::Second | Finish::Third)
    }
}

/// One counted run of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DatedOutcome {
    pub date: NaiveDate,
    pub finish: Finish,
    pub prize: Option<i64>,
}

impl DatedOutcome {
    pub fn new(date: NaiveDate, finish: Finish) -> Self {
        Self {
            date,
            finish,
            prize: None,
        }
    }
}

/// Runs and wins inside one trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    pub runs: u32,
    pub wins: u32,
    pub rate: Option<f64>,
}

/// Everything the calculator derives from an outcome list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CareerSummary {
    pub runs: u32,
    pub wins: u32,
    pub seconds: u32,
    pub thirds: u32,
    pub places: u32,
    pub prize: i64,
    pub win_rate: Option<f64>,
    pub place_rate: Option<f64>,
    pub recent_short: WindowStats,
    pub recent_long: WindowStats,
    pub last_activity_date: Option<NaiveDate>,
    pub last_win_date: Option<NaiveDate>,
    pub days_since_last_activity: Option<i64>,
    pub days_since_last_win: Option<i64>,
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentage rounded to two decimals, `None` when there is no denominator.
pub fn rate(numerator: u32, denominator: u32) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(round2(numerator as f64 / denominator as f64 * 100.0))
    }
}

/// Runs and wins with `now - days <= date <= now`.
pub fn window(outcomes: &[DatedOutcome], now: NaiveDate, days: i64) -> WindowStats {
    let start = now - Duration::days(days);
    let mut stats = WindowStats::default();
    for outcome in outcomes
        .iter()
        .filter(|o| o.date >= start && o.date <= now)
    {
        stats.runs += 1;
        if outcome.finish.is_win() {
            stats.wins += 1;
        }
    }
    stats.rate = rate(stats.wins, stats.runs);
    stats
}

/// Compute lifetime and recency statistics. Input order does not matter.
pub fn summarize(outcomes: &[DatedOutcome], now: NaiveDate) -> CareerSummary {
    let mut summary = CareerSummary::default();

    for outcome in outcomes {
        summary.runs += 1;
        match outcome.finish {
            Finish::Win => summary.wins += 1,
            Finish::Second => summary.seconds += 1,
            Finish::Third => summary.thirds += 1,
            Finish::Unplaced | Finish::NonFinish => {}
        }
        if outcome.finish.is_place() {
            summary.places += 1;
        }
        summary.prize += outcome.prize.unwrap_or(0);

        summary.last_activity_date = summary.last_activity_date.max(Some(outcome.date));
        if outcome.finish.is_win() {
            summary.last_win_date = summary.last_win_date.max(Some(outcome.date));
        }
    }

    summary.win_rate = rate(summary.wins, summary.runs);
    summary.place_rate = rate(summary.places, summary.runs);
    summary.recent_short = window(outcomes, now, RECENT_SHORT_DAYS);
    summary.recent_long = window(outcomes, now, RECENT_LONG_DAYS);
    summary.days_since_last_activity = summary.last_activity_date.map(|d| (now - d).num_days());
    summary.days_since_last_win = summary.last_win_date.map(|d| (now - d).num_days());

    summary
}

impl CareerSummary {
    /// Snapshot covering the whole career.
    pub fn snapshot(
        &self,
        entity_id: &str,
        kind: EntityKind,
        name: Option<String>,
        computed_at: DateTime<Utc>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            entity_id: entity_id.to_string(),
            kind,
            name,
            total_runs: Some(self.runs),
            total_wins: Some(self.wins),
            total_places: Some(self.places),
            total_seconds: Some(self.seconds),
            total_thirds: Some(self.thirds),
            total_prize: Some(self.prize),
            win_rate: self.win_rate,
            place_rate: self.place_rate,
            recent_14d_runs: self.recent_short.runs,
            recent_14d_wins: self.recent_short.wins,
            recent_14d_rate: self.recent_short.rate,
            recent_30d_runs: self.recent_long.runs,
            recent_30d_wins: self.recent_long.wins,
            recent_30d_rate: self.recent_long.rate,
            last_activity_date: self.last_activity_date,
            last_win_date: self.last_win_date,
            days_since_last_activity: self.days_since_last_activity,
            days_since_last_win: self.days_since_last_win,
            lifetime_complete: true,
            source: SnapshotSource::Direct,
            computed_at,
        }
    }

    /// Snapshot built from a bounded lookback. Lifetime totals are unknown,
    /// so they are left empty instead of reporting the partial counts.
    ///
    /// The lookback ends today, so a last activity or last win found in it
    /// is the real latest one. `None` for those dates only says nothing was
    /// found inside the lookback.
    pub fn bounded_snapshot(
        &self,
        entity_id: &str,
        kind: EntityKind,
        name: Option<String>,
        computed_at: DateTime<Utc>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            total_runs: None,
            total_wins: None,
            total_places: None,
            total_seconds: None,
            total_thirds: None,
            total_prize: None,
            win_rate: None,
            place_rate: None,
            lifetime_complete: false,
            source: SnapshotSource::Fallback,
            ..self.snapshot(entity_id, kind, name, computed_at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn days_ago(n: i64) -> NaiveDate {
        today() - Duration::days(n)
    }

    #[test]
    fn test_rank_normalization() {
        assert_eq!(Finish::from_rank(&1.into()), Some(Finish::Win));
        assert_eq!(Finish::from_rank(&"1".into()), Some(Finish::Win));
        assert_eq!(Finish::from_rank(&"1st".into()), Some(Finish::Win));
        assert_eq!(Finish::from_rank(&"WON".into()), Some(Finish::Win));
        assert_eq!(Finish::from_rank(&" 2nd. ".into()), Some(Finish::Second));
        assert_eq!(Finish::from_rank(&"3rd".into()), Some(Finish::Third));
        assert_eq!(Finish::from_rank(&"3着".into()), Some(Finish::Third));
        assert_eq!(Finish::from_rank(&"First".into()), Some(Finish::Win));
        assert_eq!(Finish::from_rank(&"Second".into()), Some(Finish::Second));
        assert_eq!(Finish::from_rank(&"THIRD".into()), Some(Finish::Third));
        assert!(Finish::from_rank(&"third".into()).is_some_and(|f| f.is_place()));
        assert_eq!(Finish::from_rank(&"11th".into()), Some(Finish::Unplaced));
        assert_eq!(Finish::from_rank(&7.into()), Some(Finish::Unplaced));
        assert_eq!(Finish::from_rank(&"DNF".into()), Some(Finish::NonFinish));
        assert_eq!(Finish::from_rank(&"p.u.".into()), Some(Finish::NonFinish));
        assert_eq!(Finish::from_rank(&"中止".into()), Some(Finish::NonFinish));
        assert_eq!(Finish::from_rank(&0.into()), Some(Finish::NonFinish));
    }

    #[test]
    fn test_non_starters_are_not_runs() {
        assert_eq!(Finish::from_rank(&"SCR".into()), None);
        assert_eq!(Finish::from_rank(&"取消".into()), None);
        assert_eq!(Finish::from_rank(&"".into()), None);
        assert_eq!(Finish::from_optional(None), None);
    }

    #[test]
    fn test_zero_events() {
        let summary = summarize(&[], today());
        assert_eq!(summary.runs, 0);
        assert_eq!(summary.wins, 0);
        assert_eq!(summary.places, 0);
        assert_eq!(summary.win_rate, None);
        assert_eq!(summary.place_rate, None);
        assert_eq!(summary.recent_short, WindowStats::default());
        assert_eq!(summary.recent_long, WindowStats::default());
        assert!(summary.last_activity_date.is_none());
        assert!(summary.days_since_last_win.is_none());
    }

    #[test]
    fn test_mixed_career_scenario() {
        let outcomes = vec![
            DatedOutcome::new(days_ago(0), Finish::Win),
            DatedOutcome::new(days_ago(10), Finish::Second),
            DatedOutcome::new(days_ago(20), Finish::Unplaced),
            DatedOutcome::new(days_ago(40), Finish::Win),
            DatedOutcome::new(days_ago(400), Finish::Win),
        ];
        let s = summarize(&outcomes, today());

        assert_eq!(s.runs, 5);
        assert_eq!(s.wins, 3);
        assert_eq!(s.places, 4);
        assert_eq!(s.win_rate, Some(60.0));
        assert_eq!(s.place_rate, Some(80.0));

        assert_eq!(s.recent_long.runs, 3);
        assert_eq!(s.recent_long.wins, 1);
        assert_eq!(s.recent_long.rate, Some(33.33));

        assert_eq!(s.recent_short.runs, 2);
        assert_eq!(s.recent_short.wins, 1);
        assert_eq!(s.recent_short.rate, Some(50.0));

        assert_eq!(s.last_activity_date, Some(today()));
        assert_eq!(s.days_since_last_activity, Some(0));
        assert_eq!(s.days_since_last_win, Some(0));
    }

    #[test]
    fn test_window_boundary_inclusive() {
        let outcomes = vec![
            DatedOutcome::new(days_ago(14), Finish::Win),
            DatedOutcome::new(days_ago(15), Finish::Win),
            DatedOutcome::new(days_ago(30), Finish::Unplaced),
            DatedOutcome::new(days_ago(31), Finish::Unplaced),
        ];
        let short = window(&outcomes, today(), RECENT_SHORT_DAYS);
        let long = window(&outcomes, today(), RECENT_LONG_DAYS);
        assert_eq!((short.runs, short.wins), (1, 1));
        assert_eq!((long.runs, long.wins), (3, 2));
        assert_eq!(long.rate, Some(66.67));
    }

    #[test]
    fn test_short_window_never_exceeds_long() {
        let outcomes: Vec<_> = (0..60)
            .map(|i| {
                let finish = if i % 4 == 0 { Finish::Win } else { Finish::Unplaced };
                DatedOutcome::new(days_ago(i * 3), finish)
            })
            .collect();
        for offset in 0..200 {
            let now = today() - Duration::days(offset);
            let s = summarize(&outcomes, now);
            assert!(s.recent_short.runs <= s.recent_long.runs);
            assert!(s.recent_short.wins <= s.recent_long.wins);
        }
    }

    #[test]
    fn test_place_rate_never_below_win_rate() {
        let outcomes = vec![
            DatedOutcome::new(days_ago(1), Finish::Third),
            DatedOutcome::new(days_ago(2), Finish::Win),
            DatedOutcome::new(days_ago(3), Finish::NonFinish),
        ];
        let s = summarize(&outcomes, today());
        assert!(s.place_rate.unwrap() >= s.win_rate.unwrap());
        assert_eq!(s.thirds, 1);
        assert_eq!(s.runs, 3);
    }

    #[test]
    fn test_bounded_snapshot_hides_lifetime() {
        let outcomes = vec![DatedOutcome::new(days_ago(3), Finish::Win)];
        let computed_at = Utc::now();
        let s = summarize(&outcomes, today()).bounded_snapshot("h1", EntityKind::Horse, None, computed_at);
        assert_eq!(s.total_runs, None);
        assert_eq!(s.win_rate, None);
        assert!(!s.lifetime_complete);
        assert_eq!(s.source, SnapshotSource::Fallback);
        assert_eq!(s.recent_14d_runs, 1);
        assert_eq!(s.recent_14d_rate, Some(100.0));
    }

    #[test]
    fn test_bounded_snapshot_dates_are_lookback_scoped() {
        let computed_at = Utc::now();
        let outcomes = vec![
            DatedOutcome::new(days_ago(40), Finish::Win),
            DatedOutcome::new(days_ago(4), Finish::Unplaced),
        ];
        let s = summarize(&outcomes, today()).bounded_snapshot("h1", EntityKind::Horse, None, computed_at);
        assert_eq!(s.last_win_date, Some(days_ago(40)));
        assert_eq!(s.days_since_last_win, Some(40));
        assert_eq!(s.last_activity_date, Some(days_ago(4)));

        // No win inside the lookback: unknown, and flagged as incomplete
        let s = summarize(&outcomes[1..], today()).bounded_snapshot("h1", EntityKind::Horse, None, computed_at);
        assert_eq!(s.last_win_date, None);
        assert_eq!(s.days_since_last_win, None);
        assert!(!s.lifetime_complete);
    }

    #[test]
    fn test_deterministic() {
        let outcomes = vec![
            DatedOutcome::new(days_ago(5), Finish::Second),
            DatedOutcome::new(days_ago(2), Finish::Win),
        ];
        let mut reversed = outcomes.clone();
        reversed.reverse();
        assert_eq!(summarize(&outcomes, today()), summarize(&reversed, today()));
    }
}
