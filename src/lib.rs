//! Statistics aggregation and incremental update engine for horse racing
//! entities: horses, jockeys, trainers, owners and their bloodlines.

pub mod aggregator;
pub mod availability;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod external;
pub mod pairs;
pub mod pedigree;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod types;
pub mod upsert;
pub mod window;

pub use error::{Result, StatsError};
