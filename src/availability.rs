//! Decide whether local events are enough to aggregate directly.

use tracing::info;

use crate::error::Result;
use crate::storage::StatsRepository;
use crate::types::EntityKind;

/// Which path computes the snapshots of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDecision {
    Direct,
    Fallback,
}

/// Outcome of one availability check.
#[derive(Debug, Clone)]
pub struct Availability {
    pub kind: EntityKind,
    pub decision: SourceDecision,
    pub resulted_events: u64,
    pub threshold: u64,
    pub rationale: String,
}

/// Check the local store for `kind`. Called once per kind per invocation.
pub fn detect(repo: &StatsRepository, kind: EntityKind, threshold: u64) -> Result<Availability> {
    let resulted_events = repo.count_resulted_events(kind)?;
    Ok(decide(kind, resulted_events, threshold))
}

fn decide(kind: EntityKind, resulted_events: u64, threshold: u64) -> Availability {
    let (decision, rationale) = if resulted_events >= threshold {
        (
            SourceDecision::Direct,
            format!(
                "{} resulted events for {} (threshold {}): aggregating local events",
                resulted_events, kind, threshold
            ),
        )
    } else {
        (
            SourceDecision::Fallback,
            format!(
                "only {} resulted events for {} (threshold {}): local data insufficient, \
                 reconstructing from the external results source",
                resulted_events, kind, threshold
            ),
        )
    };

    info!(kind = %kind, ?decision, "{}", rationale);

    Availability {
        kind,
        decision,
        resulted_events,
        threshold,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::test_support::{entry, race};
    use crate::window::RankValue;
    use chrono::NaiveDate;

    #[test]
    fn test_threshold_boundary() {
        assert_eq!(decide(EntityKind::Horse, 999, 1000).decision, SourceDecision::Fallback);
        assert_eq!(decide(EntityKind::Horse, 1000, 1000).decision, SourceDecision::Direct);
        assert!(decide(EntityKind::Jockey, 0, 1000).rationale.contains("insufficient"));
    }

    #[test]
    fn test_counts_only_resulted_events() {
        let repo = StatsRepository::in_memory().unwrap();
        race(&repo, "r1", NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(), "OP", 1600);
        entry(&repo, "r1", "h1", "j1", Some(RankValue::Int(1)));
        entry(&repo, "r1", "h2", "j2", Some(RankValue::Int(2)));
        entry(&repo, "r1", "h3", "j3", None);

        let availability = detect(&repo, EntityKind::Jockey, 2).unwrap();
        assert_eq!(availability.resulted_events, 2);
        assert_eq!(availability.decision, SourceDecision::Direct);

        let availability = detect(&repo, EntityKind::Jockey, 3).unwrap();
        assert_eq!(availability.decision, SourceDecision::Fallback);
    }

    #[test]
    fn test_empty_store_is_fallback() {
        let repo = StatsRepository::in_memory().unwrap();
        let availability = detect(&repo, EntityKind::Owner, 1000).unwrap();
        assert_eq!(availability.decision, SourceDecision::Fallback);
        assert_eq!(availability.resulted_events, 0);
    }
}
