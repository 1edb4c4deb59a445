//! Direct aggregation of statistics from locally stored events.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, StatsError};
use crate::storage::{EntityRef, EventRow, StatsRepository};
use crate::types::{EntityKind, StatsSnapshot};
use crate::window::{summarize, DatedOutcome, Finish};

/// Per-entity outcome of a batch computation.
pub type EntityResult<T> = (String, Result<T>);

/// Parse a stored race date.
pub(crate) fn parse_race_date(entity_id: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        StatsError::record(entity_id, format!("malformed race date {:?}: {}", raw, e))
    })
}

/// Turn stored events into counted runs. Unresulted entries and non-starters
/// are dropped; a malformed event fails the whole entity.
pub(crate) fn to_outcomes(entity_id: &str, events: &[EventRow]) -> Result<Vec<DatedOutcome>> {
    let mut outcomes = Vec::with_capacity(events.len());
    for event in events {
        let Some(finish) = Finish::from_optional(event.rank.as_ref()) else {
            continue;
        };
        outcomes.push(DatedOutcome {
            date: parse_race_date(entity_id, &event.race_date)?,
            finish,
            prize: event.prize,
        });
    }
    Ok(outcomes)
}

/// Load events for `ids` through `role_column`, `chunk_size` ids per query,
/// grouped by id.
pub(crate) fn load_events(
    repo: &StatsRepository,
    role_column: &str,
    ids: &[String],
    chunk_size: usize,
) -> Result<HashMap<String, Vec<EventRow>>> {
    let mut grouped: HashMap<String, Vec<EventRow>> = HashMap::new();
    for chunk in ids.chunks(chunk_size.max(1)) {
        for event in repo.events_for(role_column, chunk)? {
            grouped.entry(event.entity_id.clone()).or_default().push(event);
        }
    }
    Ok(grouped)
}

/// Computes full snapshots from the local event store.
pub struct DirectAggregator<'a> {
    repo: &'a StatsRepository,
    chunk_size: usize,
}

impl<'a> DirectAggregator<'a> {
    pub fn new(repo: &'a StatsRepository, chunk_size: usize) -> Self {
        Self { repo, chunk_size }
    }

    /// Compute one snapshot per entity, in input order. Entities without
    /// events get an explicit zero snapshot.
    pub fn compute(
        &self,
        kind: EntityKind,
        entities: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityResult<StatsSnapshot>>> {
        let ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        let mut events = load_events(self.repo, kind.profile().role_column, &ids, self.chunk_size)?;
        let today = now.date_naive();

        debug!(
            "Loaded events for {} of {} {} entities",
            events.len(),
            entities.len(),
            kind
        );

        let results = entities
            .iter()
            .map(|entity| {
                let entity_events = events.remove(&entity.id).unwrap_or_default();
                let snapshot = to_outcomes(&entity.id, &entity_events).map(|outcomes| {
                    summarize(&outcomes, today).snapshot(&entity.id, kind, entity.name.clone(), now)
                });
                (entity.id.clone(), snapshot)
            })
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::test_support::{entry, race};
    use crate::types::SnapshotSource;
    use crate::window::RankValue;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn days_ago(n: i64) -> NaiveDate {
        now().date_naive() - Duration::days(n)
    }

    fn entity(id: &str) -> EntityRef {
        EntityRef {
            id: id.to_string(),
            name: Some(format!("Name {}", id)),
        }
    }

    fn seed_scenario(repo: &StatsRepository) {
        let ranks: [(i64, RankValue); 5] = [
            (0, RankValue::Int(1)),
            (10, RankValue::Text("2nd".to_string())),
            (20, RankValue::Int(9)),
            (40, RankValue::Text("WON".to_string())),
            (400, RankValue::Text("1".to_string())),
        ];
        for (i, (ago, rank)) in ranks.into_iter().enumerate() {
            let race_id = format!("r{}", i);
            race(repo, &race_id, days_ago(ago), "OP", 1600);
            entry(repo, &race_id, "h1", "j1", Some(rank));
        }
    }

    #[test]
    fn test_scenario_snapshot() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_scenario(&repo);

        let aggregator = DirectAggregator::new(&repo, 1000);
        let results = aggregator
            .compute(EntityKind::Horse, &[entity("h1")], now())
            .unwrap();
        let snapshot = results[0].1.as_ref().unwrap();

        assert_eq!(snapshot.total_runs, Some(5));
        assert_eq!(snapshot.total_wins, Some(3));
        assert_eq!(snapshot.total_places, Some(4));
        assert_eq!(snapshot.win_rate, Some(60.0));
        assert_eq!(snapshot.place_rate, Some(80.0));
        assert_eq!(snapshot.recent_30d_runs, 3);
        assert_eq!(snapshot.recent_30d_wins, 1);
        assert_eq!(snapshot.recent_30d_rate, Some(33.33));
        assert_eq!(snapshot.recent_14d_runs, 2);
        assert_eq!(snapshot.recent_14d_wins, 1);
        assert_eq!(snapshot.recent_14d_rate, Some(50.0));
        assert_eq!(snapshot.total_prize, Some(5000));
        assert_eq!(snapshot.source, SnapshotSource::Direct);
        assert!(snapshot.lifetime_complete);
    }

    #[test]
    fn test_entities_without_events_are_not_omitted() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_scenario(&repo);

        let aggregator = DirectAggregator::new(&repo, 1000);
        let results = aggregator
            .compute(EntityKind::Horse, &[entity("ghost"), entity("h1")], now())
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "ghost");
        let ghost = results[0].1.as_ref().unwrap();
        assert_eq!(ghost.total_runs, Some(0));
        assert_eq!(ghost.total_wins, Some(0));
        assert_eq!(ghost.total_places, Some(0));
        assert_eq!(ghost.win_rate, None);
        assert_eq!(ghost.place_rate, None);
        assert_eq!(ghost.recent_14d_rate, None);
        assert_eq!(ghost.recent_30d_rate, None);
        assert_eq!(ghost.last_activity_date, None);
        assert_eq!(ghost.last_win_date, None);
        assert_eq!(ghost.days_since_last_activity, None);
        assert_eq!(ghost.name.as_deref(), Some("Name ghost"));
    }

    #[test]
    fn test_chunked_lookup_matches_single_query() {
        let repo = StatsRepository::in_memory().unwrap();
        race(&repo, "r1", days_ago(3), "OP", 1600);
        let entities: Vec<EntityRef> = (0..7).map(|i| entity(&format!("j{}", i))).collect();
        for (i, e) in entities.iter().enumerate() {
            entry(&repo, "r1", &format!("h{}", i), &e.id, Some(RankValue::Int(i as i64 + 1)));
        }

        let one_query = DirectAggregator::new(&repo, 1000)
            .compute(EntityKind::Jockey, &entities, now())
            .unwrap();
        let chunked = DirectAggregator::new(&repo, 2)
            .compute(EntityKind::Jockey, &entities, now())
            .unwrap();

        let a: Vec<_> = one_query.into_iter().map(|(id, r)| (id, r.unwrap())).collect();
        let b: Vec<_> = chunked.into_iter().map(|(id, r)| (id, r.unwrap())).collect();
        assert_eq!(a, b);
        assert_eq!(a[0].1.total_wins, Some(1));
        assert_eq!(a[6].1.total_wins, Some(0));
    }

    #[test]
    fn test_idempotent_on_unchanged_events() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_scenario(&repo);
        let aggregator = DirectAggregator::new(&repo, 1000);

        let first = aggregator.compute(EntityKind::Horse, &[entity("h1")], now()).unwrap();
        let second = aggregator.compute(EntityKind::Horse, &[entity("h1")], now()).unwrap();

        let first = serde_json::to_string(first[0].1.as_ref().unwrap()).unwrap();
        let second = serde_json::to_string(second[0].1.as_ref().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_event_fails_only_that_entity() {
        let repo = StatsRepository::in_memory().unwrap();
        seed_scenario(&repo);
        // A loader wrote a date the engine cannot read
        repo.insert_race(&crate::storage::RaceRecord {
            race_id: "bad".to_string(),
            race_date: days_ago(1),
            racecourse: None,
            race_number: None,
            race_name: None,
            distance: None,
            surface: None,
            race_class: None,
            field_size: None,
        })
        .unwrap();
        entry(&repo, "bad", "h2", "j2", Some(RankValue::Int(1)));
        repo.conn_for_tests()
            .execute("UPDATE races SET race_date = 'last tuesday' WHERE race_id = 'bad'", [])
            .unwrap();

        let results = DirectAggregator::new(&repo, 1000)
            .compute(EntityKind::Horse, &[entity("h1"), entity("h2")], now())
            .unwrap();
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(StatsError::RecordCompute { .. })));
    }
}
