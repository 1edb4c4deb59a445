//! SQLite storage module
//!
//! The same database holds the race event log the engine reads and the
//! statistics tables it writes.

pub mod repository;
pub mod schema;

pub use repository::{EntityRef, EntryRecord, EventRow, RaceRecord, StatsRepository};
pub use schema::create_tables;
