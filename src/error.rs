use std::path::PathBuf;

use thiserror::Error;

use crate::types::EntityKind;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("no usable data source for {kind}: {reason}")]
    SourceUnavailable { kind: EntityKind, reason: String },

    #[error("failed to compute statistics for {entity_id}: {reason}")]
    RecordCompute { entity_id: String, reason: String },

    #[error("failed to write snapshot for {entity_id}: {source}")]
    Write {
        entity_id: String,
        #[source]
        source: Box<StatsError>,
    },

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("source error: {0}")]
    Permanent(String),

    #[error("checkpoint {path:?} is unreadable: {reason}")]
    CheckpointCorruption { path: PathBuf, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StatsError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, StatsError::Transient(_))
    }

    pub fn record(entity_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StatsError::RecordCompute {
            entity_id: entity_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
