//! Entity kinds and the snapshot records computed for them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of statistics subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Horse,   // competitor
    Jockey,  // handler (rider)
    Trainer, // handler (stable)
    Owner,
    Sire,
    Dam,
    Damsire,
}

impl EntityKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "horse" | "horses" | "competitor" => Some(EntityKind::Horse),
            "jockey" | "jockeys" => Some(EntityKind::Jockey),
            "trainer" | "trainers" => Some(EntityKind::Trainer),
            "owner" | "owners" => Some(EntityKind::Owner),
            "sire" | "sires" => Some(EntityKind::Sire),
            "dam" | "dams" => Some(EntityKind::Dam),
            "damsire" | "damsires" | "bms" | "broodmare_sire" => Some(EntityKind::Damsire),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.profile().label
    }

    pub fn all() -> [EntityKind; 7] {
        [
            EntityKind::Horse,
            EntityKind::Jockey,
            EntityKind::Trainer,
            EntityKind::Owner,
            EntityKind::Sire,
            EntityKind::Dam,
            EntityKind::Damsire,
        ]
    }

    /// Ancestor tiers are aggregated through the pedigree graph.
    pub fn is_pedigree(&self) -> bool {
        matches!(self, EntityKind::Sire | EntityKind::Dam | EntityKind::Damsire)
    }

    pub fn profile(&self) -> &'static KindProfile {
        match self {
            EntityKind::Horse => &KIND_PROFILES[0],
            EntityKind::Jockey => &KIND_PROFILES[1],
            EntityKind::Trainer => &KIND_PROFILES[2],
            EntityKind::Owner => &KIND_PROFILES[3],
            EntityKind::Sire => &KIND_PROFILES[4],
            EntityKind::Dam => &KIND_PROFILES[5],
            EntityKind::Damsire => &KIND_PROFILES[6],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage and wire naming for one entity kind.
///
/// Every per-kind difference lives here so the aggregation code never
/// branches on the kind for naming purposes.
#[derive(Debug)]
pub struct KindProfile {
    pub kind: EntityKind,
    pub label: &'static str,
    /// Column of `race_entries` holding this kind's id. Ancestor tiers run
    /// their own career under `horse_id`.
    pub role_column: &'static str,
    /// Column of `race_entries` carrying the display name for `role_column`.
    pub name_column: &'static str,
    pub stats_table: &'static str,
    /// Name of the lifetime run counter in `stats_table`.
    pub runs_column: &'static str,
    /// Path segment of the external results API.
    pub api_segment: &'static str,
}

pub static KIND_PROFILES: [KindProfile; 7] = [
    KindProfile {
        kind: EntityKind::Horse,
        label: "horse",
        role_column: "horse_id",
        name_column: "horse_name",
        stats_table: "horse_stats",
        runs_column: "total_runs",
        api_segment: "horses",
    },
    KindProfile {
        kind: EntityKind::Jockey,
        label: "jockey",
        role_column: "jockey_id",
        name_column: "jockey_name",
        stats_table: "jockey_stats",
        runs_column: "total_rides",
        api_segment: "jockeys",
    },
    KindProfile {
        kind: EntityKind::Trainer,
        label: "trainer",
        role_column: "trainer_id",
        name_column: "trainer_name",
        stats_table: "trainer_stats",
        runs_column: "total_runners",
        api_segment: "trainers",
    },
    KindProfile {
        kind: EntityKind::Owner,
        label: "owner",
        role_column: "owner_id",
        name_column: "owner_name",
        stats_table: "owner_stats",
        runs_column: "total_runners",
        api_segment: "owners",
    },
    KindProfile {
        kind: EntityKind::Sire,
        label: "sire",
        role_column: "horse_id",
        name_column: "horse_name",
        stats_table: "sire_stats",
        runs_column: "total_runs",
        api_segment: "horses",
    },
    KindProfile {
        kind: EntityKind::Dam,
        label: "dam",
        role_column: "horse_id",
        name_column: "horse_name",
        stats_table: "dam_stats",
        runs_column: "total_runs",
        api_segment: "horses",
    },
    KindProfile {
        kind: EntityKind::Damsire,
        label: "damsire",
        role_column: "horse_id",
        name_column: "horse_name",
        stats_table: "damsire_stats",
        runs_column: "total_runs",
        api_segment: "horses",
    },
];

/// Where a snapshot's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Direct,
    Fallback,
}

impl SnapshotSource {
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotSource::Direct => "direct",
            SnapshotSource::Fallback => "fallback",
        }
    }
}

/// Full statistics record for one entity. Replaced as a whole on write.
///
/// Lifetime fields are `None` when the source could not see the whole
/// career (fallback reconstruction), which is different from `Some(0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub entity_id: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub total_runs: Option<u32>,
    pub total_wins: Option<u32>,
    pub total_places: Option<u32>,
    pub total_seconds: Option<u32>,
    pub total_thirds: Option<u32>,
    pub total_prize: Option<i64>,
    pub win_rate: Option<f64>,
    pub place_rate: Option<f64>,
    pub recent_14d_runs: u32,
    pub recent_14d_wins: u32,
    pub recent_14d_rate: Option<f64>,
    pub recent_30d_runs: u32,
    pub recent_30d_wins: u32,
    pub recent_30d_rate: Option<f64>,
    /// Latest run. With `lifetime_complete == false`, `None` means no run
    /// inside the external lookback rather than no run ever.
    pub last_activity_date: Option<NaiveDate>,
    /// Latest win, scoped like `last_activity_date`
    pub last_win_date: Option<NaiveDate>,
    pub days_since_last_activity: Option<i64>,
    pub days_since_last_win: Option<i64>,
    pub lifetime_complete: bool,
    pub source: SnapshotSource,
    pub computed_at: DateTime<Utc>,
}

/// One row of a class or distance breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub label: String,
    pub runs: u32,
    pub wins: u32,
    pub win_percent: Option<f64>,
    pub ae_index: Option<f64>,
}

/// Ancestor statistics: own career plus descendant performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedigreeSnapshot {
    pub entity_id: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    /// Present only when the ancestor itself has raced.
    pub own_career: Option<StatsSnapshot>,
    pub descendant_count: u32,
    pub descendant_runs: u32,
    pub descendant_wins: u32,
    pub descendant_places: u32,
    pub descendant_prize: i64,
    pub descendant_win_rate: Option<f64>,
    pub descendant_place_rate: Option<f64>,
    pub avg_runs_per_descendant: Option<f64>,
    pub avg_wins_per_descendant: Option<f64>,
    pub best_class: Option<String>,
    pub class_breakdown: Vec<BreakdownEntry>,
    pub distance_breakdown: Vec<BreakdownEntry>,
    pub computed_at: DateTime<Utc>,
}

/// Pairings whose combined record is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairKind {
    JockeyHorse,
    TrainerJockey,
    OwnerTrainer,
}

impl PairKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "jockey-horse" => Some(PairKind::JockeyHorse),
            "trainer-jockey" => Some(PairKind::TrainerJockey),
            "owner-trainer" => Some(PairKind::OwnerTrainer),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PairKind::JockeyHorse => "jockey-horse",
            PairKind::TrainerJockey => "trainer-jockey",
            PairKind::OwnerTrainer => "owner-trainer",
        }
    }

    /// `race_entries` columns for the first and second member.
    pub fn columns(&self) -> (&'static str, &'static str) {
        match self {
            PairKind::JockeyHorse => ("jockey_id", "horse_id"),
            PairKind::TrainerJockey => ("trainer_id", "jockey_id"),
            PairKind::OwnerTrainer => ("owner_id", "trainer_id"),
        }
    }
}

impl fmt::Display for PairKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Combined record of two entities appearing in the same entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    pub pair_kind: PairKind,
    pub first_id: String,
    pub second_id: String,
    pub runs: u32,
    pub wins: u32,
    pub seconds: u32,
    pub thirds: u32,
    pub win_percent: Option<f64>,
    pub place_percent: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in EntityKind::all() {
            assert_eq!(EntityKind::from_str(kind.name()), Some(kind));
            assert_eq!(kind.profile().kind, kind);
        }
        assert_eq!(EntityKind::from_str("BMS"), Some(EntityKind::Damsire));
        assert_eq!(EntityKind::from_str("groom"), None);
    }

    #[test]
    fn test_field_mapping_varies_by_kind() {
        assert_eq!(EntityKind::Horse.profile().runs_column, "total_runs");
        assert_eq!(EntityKind::Jockey.profile().runs_column, "total_rides");
        assert_eq!(EntityKind::Owner.profile().role_column, "owner_id");
        assert!(EntityKind::Damsire.is_pedigree());
        assert!(!EntityKind::Trainer.is_pedigree());
    }

    #[test]
    fn test_pair_kind_parse() {
        assert_eq!(PairKind::from_str("jockey_horse"), Some(PairKind::JockeyHorse));
        assert_eq!(PairKind::from_str("Owner-Trainer"), Some(PairKind::OwnerTrainer));
        assert_eq!(PairKind::TrainerJockey.columns(), ("trainer_id", "jockey_id"));
        assert_eq!(PairKind::from_str("horse-horse"), None);
    }
}
