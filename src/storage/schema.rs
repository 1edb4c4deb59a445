//! SQLite schema definitions
//!
//! Tables:
//! - races: Core race information
//! - race_entries: One outcome record per (race, horse), with the
//!   jockey/trainer/owner roles of that entry
//! - entities: Registry of statistics subjects per kind
//! - pedigree: Sire/dam edges for every horse with known parents
//! - {kind}_stats: One snapshot row per entity
//! - pair_stats: Combined records of entity pairs

use rusqlite::{Connection, Result};

use crate::types::KIND_PROFILES;

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Core race information
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS races (
            race_id TEXT PRIMARY KEY,
            race_date TEXT NOT NULL,
            racecourse TEXT,
            race_number INTEGER,
            race_name TEXT,
            distance INTEGER,
            surface TEXT,
            race_class TEXT,
            field_size INTEGER,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
        [],
    )?;

    // finish_position has no declared type so integer ranks and text codes
    // are both kept exactly as they arrived.
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS race_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id TEXT NOT NULL REFERENCES races(race_id),
            horse_id TEXT NOT NULL,
            horse_name TEXT,
            post_position INTEGER,
            jockey_id TEXT,
            jockey_name TEXT,
            trainer_id TEXT,
            trainer_name TEXT,
            owner_id TEXT,
            owner_name TEXT,
            finish_position,
            prize INTEGER,
            UNIQUE(race_id, horse_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            name TEXT,
            PRIMARY KEY (kind, entity_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pedigree (
            horse_id TEXT PRIMARY KEY,
            sire_id TEXT,
            dam_id TEXT
        )
        "#,
        [],
    )?;

    for profile in KIND_PROFILES.iter() {
        let sql = if profile.kind.is_pedigree() {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    entity_id TEXT PRIMARY KEY,
                    name TEXT,
                    own_runs INTEGER,
                    own_wins INTEGER,
                    own_win_rate REAL,
                    own_career TEXT,
                    descendant_count INTEGER NOT NULL,
                    descendant_runs INTEGER NOT NULL,
                    descendant_wins INTEGER NOT NULL,
                    descendant_places INTEGER NOT NULL,
                    descendant_prize INTEGER NOT NULL,
                    descendant_win_rate REAL,
                    descendant_place_rate REAL,
                    avg_runs_per_descendant REAL,
                    avg_wins_per_descendant REAL,
                    best_class TEXT,
                    class_breakdown TEXT NOT NULL,
                    distance_breakdown TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    computed_at TEXT NOT NULL
                )
                "#,
                table = profile.stats_table
            )
        } else {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    entity_id TEXT PRIMARY KEY,
                    name TEXT,
                    {runs} INTEGER,
                    total_wins INTEGER,
                    total_places INTEGER,
                    total_seconds INTEGER,
                    total_thirds INTEGER,
                    total_prize INTEGER,
                    win_rate REAL,
                    place_rate REAL,
                    recent_14d_runs INTEGER NOT NULL,
                    recent_14d_wins INTEGER NOT NULL,
                    recent_14d_rate REAL,
                    recent_30d_runs INTEGER NOT NULL,
                    recent_30d_wins INTEGER NOT NULL,
                    recent_30d_rate REAL,
                    last_activity_date TEXT,
                    last_win_date TEXT,
                    days_since_last_activity INTEGER,
                    days_since_last_win INTEGER,
                    lifetime_complete INTEGER NOT NULL,
                    source TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    computed_at TEXT NOT NULL
                )
                "#,
                table = profile.stats_table,
                runs = profile.runs_column
            )
        };
        conn.execute(&sql, [])?;
    }

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pair_stats (
            pair_kind TEXT NOT NULL,
            first_id TEXT NOT NULL,
            second_id TEXT NOT NULL,
            runs INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            seconds INTEGER NOT NULL,
            thirds INTEGER NOT NULL,
            win_percent REAL,
            place_percent REAL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (pair_kind, first_id, second_id)
        )
        "#,
        [],
    )?;

    // Create indexes for common queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_races_date ON races(race_date)",
        [],
    )?;
    for column in ["horse_id", "jockey_id", "trainer_id", "owner_id"] {
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_race_entries_{col} ON race_entries({col})",
                col = column
            ),
            [],
        )?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pedigree_sire ON pedigree(sire_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pedigree_dam ON pedigree(dam_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        // Verify tables exist
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('races', 'race_entries', 'entities', 'pedigree', 'pair_stats',
                  'horse_stats', 'jockey_stats', 'trainer_stats', 'owner_stats',
                  'sire_stats', 'dam_stats', 'damsire_stats')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn test_runs_column_follows_kind() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let has_rides: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('jockey_stats') WHERE name = 'total_rides'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_rides, 1);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        // Should not fail on second call
        create_tables(&conn).unwrap();
    }
}
