//! SQLite repository: event store reads and snapshot writes

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use super::schema::create_tables;
use crate::error::{Result, StatsError};
use crate::types::{EntityKind, PairKind, PairStats, PedigreeSnapshot, StatsSnapshot};
use crate::window::RankValue;

/// Race information
#[derive(Debug, Clone)]
pub struct RaceRecord {
    pub race_id: String,
    pub race_date: NaiveDate,
    pub racecourse: Option<String>,
    pub race_number: Option<u8>,
    pub race_name: Option<String>,
    pub distance: Option<u32>,
    pub surface: Option<String>,
    pub race_class: Option<String>,
    pub field_size: Option<u8>,
}

/// One horse's entry in a race, with its result
#[derive(Debug, Clone, Default)]
pub struct EntryRecord {
    pub race_id: String,
    pub horse_id: String,
    pub horse_name: Option<String>,
    pub post_position: Option<u8>,
    pub jockey_id: Option<String>,
    pub jockey_name: Option<String>,
    pub trainer_id: Option<String>,
    pub trainer_name: Option<String>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub finish_position: Option<RankValue>,
    pub prize: Option<i64>,
}

/// Registered statistics subject
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRef {
    pub id: String,
    pub name: Option<String>,
}

/// Outcome record joined with its race
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Value of the role column the events were looked up by
    pub entity_id: String,
    pub race_id: String,
    /// Raw stored date; parsed by the aggregators
    pub race_date: String,
    pub rank: Option<RankValue>,
    pub prize: Option<i64>,
    pub race_class: Option<String>,
    pub distance: Option<u32>,
}

fn rank_to_sql(rank: &Option<RankValue>) -> Value {
    match rank {
        Some(RankValue::Int(n)) => Value::Integer(*n),
        Some(RankValue::Text(s)) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn rank_from_sql(value: Value) -> Option<RankValue> {
    match value {
        Value::Integer(n) => Some(RankValue::Int(n)),
        Value::Real(f) => Some(RankValue::Int(f as i64)),
        Value::Text(s) => Some(RankValue::Text(s)),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Serialized metric content used to detect unchanged snapshots.
/// `computed_at` is left out so that recomputing identical numbers is a no-op.
fn payload_of<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_value(value)?;
    if let Some(obj) = json.as_object_mut() {
        obj.remove("computed_at");
        if let Some(own) = obj.get_mut("own_career").and_then(|v| v.as_object_mut()) {
            own.remove("computed_at");
        }
    }
    Ok(json.to_string())
}

fn restore_payload<T: DeserializeOwned>(payload: &str, computed_at: &str) -> Result<T> {
    let mut json: serde_json::Value = serde_json::from_str(payload)?;
    let stamp = serde_json::Value::String(computed_at.to_string());
    if let Some(obj) = json.as_object_mut() {
        obj.insert("computed_at".to_string(), stamp.clone());
        if let Some(own) = obj.get_mut("own_career").and_then(|v| v.as_object_mut()) {
            own.insert("computed_at".to_string(), stamp);
        }
    }
    Ok(serde_json::from_value(json)?)
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.to_string())
}

fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Build an upsert that only touches the row when its payload changed.
fn upsert_sql(table: &str, columns: &[&str]) -> String {
    let values: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = excluded.{c}", c = c))
        .collect();
    format!(
        "INSERT INTO {table} ({cols}) VALUES ({vals}) \
         ON CONFLICT(entity_id) DO UPDATE SET {updates} \
         WHERE {table}.payload IS NOT excluded.payload",
        table = table,
        cols = columns.join(", "),
        vals = values.join(", "),
        updates = updates.join(", ")
    )
}

/// Repository over the race event store and the statistics tables
pub struct StatsRepository {
    conn: Connection,
}

impl StatsRepository {
    /// Create a new repository, initializing the database if needed
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // Enable foreign keys
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        // Create tables if they don't exist
        create_tables(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection for tests that need to corrupt data
    #[cfg(test)]
    pub fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    // ==================== Event Store Writes ====================

    /// Insert a race (upsert)
    pub fn insert_race(&self, race: &RaceRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO races
            (race_id, race_date, racecourse, race_number, race_name, distance,
             surface, race_class, field_size)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                race.race_id,
                race.race_date.to_string(),
                race.racecourse,
                race.race_number,
                race.race_name,
                race.distance,
                race.surface,
                race.race_class,
                race.field_size,
            ],
        )?;
        Ok(())
    }

    /// Insert a race entry; a corrected record replaces the old one by key
    pub fn insert_entry(&self, entry: &EntryRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO race_entries
            (race_id, horse_id, horse_name, post_position, jockey_id, jockey_name,
             trainer_id, trainer_name, owner_id, owner_name, finish_position, prize)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                entry.race_id,
                entry.horse_id,
                entry.horse_name,
                entry.post_position,
                entry.jockey_id,
                entry.jockey_name,
                entry.trainer_id,
                entry.trainer_name,
                entry.owner_id,
                entry.owner_name,
                rank_to_sql(&entry.finish_position),
                entry.prize,
            ],
        )?;
        Ok(())
    }

    /// Register an entity
    pub fn insert_entity(&self, kind: EntityKind, entity_id: &str, name: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entities (kind, entity_id, name) VALUES (?1, ?2, ?3)",
            params![kind.name(), entity_id, name],
        )?;
        Ok(())
    }

    /// Record the parents of a horse
    pub fn insert_pedigree(
        &self,
        horse_id: &str,
        sire_id: Option<&str>,
        dam_id: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pedigree (horse_id, sire_id, dam_id) VALUES (?1, ?2, ?3)",
            params![horse_id, sire_id, dam_id],
        )?;
        Ok(())
    }

    /// Add registry rows for every id seen in the events (or, for ancestor
    /// tiers, in the pedigree graph) that is not registered yet.
    pub fn register_entities(&self, kind: EntityKind) -> Result<usize> {
        let profile = kind.profile();
        let horse_name = "(SELECT h.name FROM entities h WHERE h.kind = 'horse' AND h.entity_id = {id})";
        let sql = match kind {
            EntityKind::Sire | EntityKind::Dam => {
                let column = if kind == EntityKind::Sire { "p.sire_id" } else { "p.dam_id" };
                format!(
                    "INSERT OR IGNORE INTO entities (kind, entity_id, name) \
                     SELECT ?1, {col}, {name} FROM pedigree p WHERE {col} IS NOT NULL GROUP BY {col}",
                    col = column,
                    name = horse_name.replace("{id}", column)
                )
            }
            EntityKind::Damsire => format!(
                "INSERT OR IGNORE INTO entities (kind, entity_id, name) \
                 SELECT ?1, mare.sire_id, {name} FROM pedigree mare \
                 WHERE mare.sire_id IS NOT NULL \
                   AND mare.horse_id IN (SELECT dam_id FROM pedigree WHERE dam_id IS NOT NULL) \
                 GROUP BY mare.sire_id",
                name = horse_name.replace("{id}", "mare.sire_id")
            ),
            _ => format!(
                "INSERT OR IGNORE INTO entities (kind, entity_id, name) \
                 SELECT ?1, {role}, MAX({name}) FROM race_entries \
                 WHERE {role} IS NOT NULL GROUP BY {role}",
                role = profile.role_column,
                name = profile.name_column
            ),
        };
        Ok(self.conn.execute(&sql, [kind.name()])?)
    }

    // ==================== Event Store Queries ====================

    /// Count resulted events that can feed statistics of `kind`
    pub fn count_resulted_events(&self, kind: EntityKind) -> Result<u64> {
        let sql = if kind.is_pedigree() {
            "SELECT COUNT(*) FROM race_entries re JOIN pedigree p ON p.horse_id = re.horse_id \
             WHERE re.finish_position IS NOT NULL"
                .to_string()
        } else {
            format!(
                "SELECT COUNT(*) FROM race_entries WHERE finish_position IS NOT NULL AND {} IS NOT NULL",
                kind.profile().role_column
            )
        };
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn entity_filter(kind: EntityKind) -> String {
        if kind.is_pedigree() {
            "e.kind = ?1 AND ?2 IS NULL".to_string()
        } else {
            format!(
                "e.kind = ?1 AND (?2 IS NULL OR EXISTS ( \
                     SELECT 1 FROM race_entries re JOIN races r ON r.race_id = re.race_id \
                     WHERE re.{role} = e.entity_id AND r.race_date >= ?2))",
                role = kind.profile().role_column
            )
        }
    }

    /// Count registered entities, optionally only those active since a date
    pub fn count_entities(&self, kind: EntityKind, active_since: Option<NaiveDate>) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM entities e WHERE {}",
            Self::entity_filter(kind)
        );
        let active = if kind.is_pedigree() { None } else { date_text(active_since) };
        let count: i64 = self
            .conn
            .query_row(&sql, params![kind.name(), active], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Page through registered entities ordered by id.
    ///
    /// `active_since` restricts role kinds to entities with an event on or
    /// after that date; ancestor tiers ignore it. Paging is keyed on the
    /// last id seen (`after`), so ids registered or dropped from the filter
    /// between pages never shift the remaining ones.
    pub fn list_entities(
        &self,
        kind: EntityKind,
        active_since: Option<NaiveDate>,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<EntityRef>> {
        let sql = format!(
            "SELECT e.entity_id, e.name FROM entities e WHERE {} \
             AND (?3 IS NULL OR e.entity_id > ?3) \
             ORDER BY e.entity_id LIMIT ?4",
            Self::entity_filter(kind)
        );
        let active = if kind.is_pedigree() { None } else { date_text(active_since) };
        let mut stmt = self.conn.prepare(&sql)?;
        let entities = stmt
            .query_map(
                params![kind.name(), active, after, limit as i64],
                |row| {
                    Ok(EntityRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// Events whose `role_column` is one of `ids`, joined with race data.
    /// Callers are expected to keep `ids` within the store's variable limit.
    pub fn events_for(&self, role_column: &str, ids: &[String]) -> Result<Vec<EventRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT re.{role}, re.race_id, r.race_date, re.finish_position, re.prize, \
                    r.race_class, r.distance \
             FROM race_entries re JOIN races r ON r.race_id = re.race_id \
             WHERE re.{role} IN ({ph}) \
             ORDER BY re.{role}, r.race_date, re.race_id",
            role = role_column,
            ph = placeholders(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok(EventRow {
                    entity_id: row.get(0)?,
                    race_id: row.get(1)?,
                    race_date: row.get(2)?,
                    rank: rank_from_sql(row.get(3)?),
                    prize: row.get(4)?,
                    race_class: row.get(5)?,
                    distance: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Direct descendants of a sire or dam; grandoffspring through the
    /// daughters of a damsire.
    pub fn descendants(&self, kind: EntityKind, ancestor_id: &str) -> Result<Vec<String>> {
        let sql = match kind {
            EntityKind::Sire => "SELECT horse_id FROM pedigree WHERE sire_id = ?1 ORDER BY horse_id",
            EntityKind::Dam => "SELECT horse_id FROM pedigree WHERE dam_id = ?1 ORDER BY horse_id",
            EntityKind::Damsire => {
                "SELECT DISTINCT foal.horse_id FROM pedigree mare \
                 JOIN pedigree foal ON foal.dam_id = mare.horse_id \
                 WHERE mare.sire_id = ?1 ORDER BY foal.horse_id"
            }
            _ => return Ok(Vec::new()),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map([ancestor_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Stream `(race_class, rank)` of every resulted event
    pub fn for_each_class_result<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Option<String>, Option<RankValue>),
    {
        let mut stmt = self.conn.prepare(
            "SELECT r.race_class, re.finish_position \
             FROM race_entries re JOIN races r ON r.race_id = re.race_id \
             WHERE re.finish_position IS NOT NULL",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            f(row.get(0)?, rank_from_sql(row.get(1)?));
        }
        Ok(())
    }

    /// Stream `(first, second, rank)` of every resulted event where both
    /// members of the pair are present
    pub fn for_each_pair_event<F>(&self, kind: PairKind, mut f: F) -> Result<()>
    where
        F: FnMut(String, String, Option<RankValue>),
    {
        let (first, second) = kind.columns();
        let sql = format!(
            "SELECT {a}, {b}, finish_position FROM race_entries \
             WHERE {a} IS NOT NULL AND {b} IS NOT NULL AND finish_position IS NOT NULL",
            a = first,
            b = second
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            f(row.get(0)?, row.get(1)?, rank_from_sql(row.get(2)?));
        }
        Ok(())
    }

    // ==================== Snapshot Writes ====================

    /// Write a statistics snapshot. Returns `true` when the stored row changed.
    pub fn upsert_stats(&self, snapshot: &StatsSnapshot) -> Result<bool> {
        let profile = snapshot.kind.profile();
        let columns = [
            "entity_id",
            "name",
            profile.runs_column,
            "total_wins",
            "total_places",
            "total_seconds",
            "total_thirds",
            "total_prize",
            "win_rate",
            "place_rate",
            "recent_14d_runs",
            "recent_14d_wins",
            "recent_14d_rate",
            "recent_30d_runs",
            "recent_30d_wins",
            "recent_30d_rate",
            "last_activity_date",
            "last_win_date",
            "days_since_last_activity",
            "days_since_last_win",
            "lifetime_complete",
            "source",
            "payload",
            "computed_at",
        ];
        let sql = upsert_sql(profile.stats_table, &columns);
        let changed = self.conn.execute(
            &sql,
            params![
                snapshot.entity_id,
                snapshot.name,
                snapshot.total_runs,
                snapshot.total_wins,
                snapshot.total_places,
                snapshot.total_seconds,
                snapshot.total_thirds,
                snapshot.total_prize,
                snapshot.win_rate,
                snapshot.place_rate,
                snapshot.recent_14d_runs,
                snapshot.recent_14d_wins,
                snapshot.recent_14d_rate,
                snapshot.recent_30d_runs,
                snapshot.recent_30d_wins,
                snapshot.recent_30d_rate,
                date_text(snapshot.last_activity_date),
                date_text(snapshot.last_win_date),
                snapshot.days_since_last_activity,
                snapshot.days_since_last_win,
                snapshot.lifetime_complete,
                snapshot.source.name(),
                payload_of(snapshot)?,
                timestamp_text(snapshot.computed_at),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Write a pedigree snapshot. Returns `true` when the stored row changed.
    pub fn upsert_pedigree(&self, snapshot: &PedigreeSnapshot) -> Result<bool> {
        let columns = [
            "entity_id",
            "name",
            "own_runs",
            "own_wins",
            "own_win_rate",
            "own_career",
            "descendant_count",
            "descendant_runs",
            "descendant_wins",
            "descendant_places",
            "descendant_prize",
            "descendant_win_rate",
            "descendant_place_rate",
            "avg_runs_per_descendant",
            "avg_wins_per_descendant",
            "best_class",
            "class_breakdown",
            "distance_breakdown",
            "payload",
            "computed_at",
        ];
        let sql = upsert_sql(snapshot.kind.profile().stats_table, &columns);
        let own = snapshot.own_career.as_ref();
        let own_json = own.map(serde_json::to_string).transpose()?;
        let changed = self.conn.execute(
            &sql,
            params![
                snapshot.entity_id,
                snapshot.name,
                own.and_then(|o| o.total_runs),
                own.and_then(|o| o.total_wins),
                own.and_then(|o| o.win_rate),
                own_json,
                snapshot.descendant_count,
                snapshot.descendant_runs,
                snapshot.descendant_wins,
                snapshot.descendant_places,
                snapshot.descendant_prize,
                snapshot.descendant_win_rate,
                snapshot.descendant_place_rate,
                snapshot.avg_runs_per_descendant,
                snapshot.avg_wins_per_descendant,
                snapshot.best_class,
                serde_json::to_string(&snapshot.class_breakdown)?,
                serde_json::to_string(&snapshot.distance_breakdown)?,
                payload_of(snapshot)?,
                timestamp_text(snapshot.computed_at),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Replace every stored pair of `kind` in one transaction
    pub fn replace_pairs(&self, kind: PairKind, pairs: &[PairStats]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pair_stats WHERE pair_kind = ?1", [kind.name()])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO pair_stats
                (pair_kind, first_id, second_id, runs, wins, seconds, thirds,
                 win_percent, place_percent, computed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            for pair in pairs {
                stmt.execute(params![
                    kind.name(),
                    pair.first_id,
                    pair.second_id,
                    pair.runs,
                    pair.wins,
                    pair.seconds,
                    pair.thirds,
                    pair.win_percent,
                    pair.place_percent,
                    timestamp_text(pair.computed_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(pairs.len())
    }

    /// Open a write transaction spanning several upserts
    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the open transaction, rolling back if the commit fails
    pub fn commit(&self) -> Result<()> {
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }

    // ==================== Snapshot Reads ====================

    /// Load the stored snapshot of an entity
    pub fn get_stats(&self, kind: EntityKind, entity_id: &str) -> Result<Option<StatsSnapshot>> {
        self.get_payload(kind, entity_id)
    }

    /// Load the stored pedigree snapshot of an ancestor
    pub fn get_pedigree(&self, kind: EntityKind, entity_id: &str) -> Result<Option<PedigreeSnapshot>> {
        self.get_payload(kind, entity_id)
    }

    fn get_payload<T: DeserializeOwned>(&self, kind: EntityKind, entity_id: &str) -> Result<Option<T>> {
        let sql = format!(
            "SELECT payload, computed_at FROM {} WHERE entity_id = ?1",
            kind.profile().stats_table
        );
        let row: Option<(String, String)> = self
            .conn
            .query_row(&sql, [entity_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        row.map(|(payload, computed_at)| restore_payload(&payload, &computed_at))
            .transpose()
    }

    /// Count stored snapshots of a kind
    pub fn count_stats(&self, kind: EntityKind) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.profile().stats_table);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Stored pairs of a kind ordered by (first, second)
    pub fn get_pairs(&self, kind: PairKind) -> Result<Vec<PairStats>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT first_id, second_id, runs, wins, seconds, thirds,
                   win_percent, place_percent, computed_at
            FROM pair_stats
            WHERE pair_kind = ?1
            ORDER BY first_id, second_id
            "#,
        )?;
        let rows = stmt
            .query_map([kind.name()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(first_id, second_id, runs, wins, seconds, thirds, win_percent, place_percent, ts)| {
                let computed_at = DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| StatsError::record(&first_id, e))?
                    .with_timezone(&Utc);
                Ok(PairStats {
                    pair_kind: kind,
                    first_id,
                    second_id,
                    runs,
                    wins,
                    seconds,
                    thirds,
                    win_percent,
                    place_percent,
                    computed_at,
                })
            })
            .collect()
    }
}
