//! Resumable progress tracking for batch runs.
//!
//! Each kind owns one JSON file (`{dir}/{kind}.json`), so runs over
//! different kinds never write the same file. Files are replaced with a
//! write-to-temp-then-rename so a crash never leaves a half-written
//! checkpoint behind.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, StatsError};
use crate::types::EntityKind;

/// Progress of one kind.
///
/// The run resumes after `last_entity_id`, with the activity horizon the
/// kind started with, so a resume on a later day walks the same list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindCheckpoint {
    /// Entities already processed
    pub last_offset: u64,
    /// Highest id processed so far
    #[serde(default)]
    pub last_entity_id: Option<String>,
    /// Activity horizon pinned at the first batch; `None` means every
    /// registered entity
    #[serde(default)]
    pub active_since: Option<NaiveDate>,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl KindCheckpoint {
    fn fresh() -> Self {
        Self {
            last_offset: 0,
            last_entity_id: None,
            active_since: None,
            completed: false,
            updated_at: Utc::now(),
        }
    }
}

/// Progress of every kind in one invocation.
#[derive(Debug)]
pub struct CheckpointManager {
    /// `None` keeps state in memory only (dry runs)
    dir: Option<PathBuf>,
    states: BTreeMap<EntityKind, KindCheckpoint>,
}

impl CheckpointManager {
    /// Load state for `kinds`. Without `resume` any previous progress is
    /// discarded.
    pub fn acquire(dir: &Path, kinds: &[EntityKind], resume: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut states = BTreeMap::new();

        for &kind in kinds {
            let path = checkpoint_path(dir, kind);
            let state = if resume {
                match load(&path, kind) {
                    Ok(Some(state)) => {
                        info!(
                            "Resuming {} after {:?} at offset {} (completed: {})",
                            kind, state.last_entity_id, state.last_offset, state.completed
                        );
                        state
                    }
                    Ok(None) => KindCheckpoint::fresh(),
                    Err(e) => {
                        warn!("{}; starting {} from the beginning", e, kind);
                        KindCheckpoint::fresh()
                    }
                }
            } else {
                if path.exists() {
                    debug!("Discarding previous checkpoint {:?}", path);
                    fs::remove_file(&path)?;
                }
                KindCheckpoint::fresh()
            };
            states.insert(kind, state);
        }

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            states,
        })
    }

    /// State that is never persisted.
    pub fn in_memory(kinds: &[EntityKind]) -> Self {
        Self {
            dir: None,
            states: kinds.iter().map(|&k| (k, KindCheckpoint::fresh())).collect(),
        }
    }

    pub fn start_offset(&self, kind: EntityKind) -> u64 {
        self.states.get(&kind).map(|s| s.last_offset).unwrap_or(0)
    }

    /// Id the next batch starts after.
    pub fn cursor(&self, kind: EntityKind) -> Option<String> {
        self.states.get(&kind).and_then(|s| s.last_entity_id.clone())
    }

    pub fn is_completed(&self, kind: EntityKind) -> bool {
        self.states.get(&kind).map(|s| s.completed).unwrap_or(false)
    }

    /// Horizon for `kind`: the one stored by an interrupted run once it
    /// has committed a batch, otherwise `proposed`, which is then kept.
    pub fn pin_horizon(&mut self, kind: EntityKind, proposed: Option<NaiveDate>) -> Option<NaiveDate> {
        let state = self.states.entry(kind).or_insert_with(KindCheckpoint::fresh);
        if state.last_entity_id.is_none() {
            state.active_since = proposed;
        } else if state.active_since != proposed {
            info!(
                "{}: keeping checkpointed horizon {:?} instead of {:?}",
                kind, state.active_since, proposed
            );
        }
        state.active_since
    }

    /// Record that `offset` entities of `kind` are done, the last being
    /// `last_entity_id`.
    pub fn commit_batch(&mut self, kind: EntityKind, offset: u64, last_entity_id: &str) -> Result<()> {
        let state = self.states.entry(kind).or_insert_with(KindCheckpoint::fresh);
        let behind = state
            .last_entity_id
            .as_deref()
            .is_some_and(|last| last_entity_id <= last);
        if offset < state.last_offset || behind {
            debug!(
                "Ignoring backwards checkpoint for {}: {} ({}) behind {} ({:?})",
                kind, offset, last_entity_id, state.last_offset, state.last_entity_id
            );
            return Ok(());
        }
        state.last_offset = offset;
        state.last_entity_id = Some(last_entity_id.to_string());
        state.updated_at = Utc::now();
        self.persist(kind)
    }

    pub fn mark_completed(&mut self, kind: EntityKind) -> Result<()> {
        let state = self.states.entry(kind).or_insert_with(KindCheckpoint::fresh);
        state.completed = true;
        state.updated_at = Utc::now();
        self.persist(kind)
    }

    /// Remove the checkpoint files once every kind completed. Returns
    /// whether they were removed.
    pub fn release(self) -> Result<bool> {
        let Some(dir) = &self.dir else {
            return Ok(false);
        };
        if !self.states.values().all(|s| s.completed) {
            info!("Run incomplete; keeping checkpoints in {:?}", dir);
            return Ok(false);
        }
        for kind in self.states.keys() {
            let path = checkpoint_path(dir, *kind);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(true)
    }

    fn persist(&self, kind: EntityKind) -> Result<()> {
        let (Some(dir), Some(state)) = (&self.dir, self.states.get(&kind)) else {
            return Ok(());
        };

        let mut file = BTreeMap::new();
        file.insert(kind, state);
        let json = serde_json::to_string_pretty(&file)?;

        // Atomic replace: temp file in the same directory, then rename
        let path = checkpoint_path(dir, kind);
        let temp_path = dir.join(format!(".{}.json.tmp", kind.name()));
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

fn checkpoint_path(dir: &Path, kind: EntityKind) -> PathBuf {
    dir.join(format!("{}.json", kind.name()))
}

fn load(path: &Path, kind: EntityKind) -> Result<Option<KindCheckpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    let corruption = |reason: String| StatsError::CheckpointCorruption {
        path: path.to_path_buf(),
        reason,
    };

    let raw = fs::read_to_string(path).map_err(|e| corruption(e.to_string()))?;
    let mut file: BTreeMap<EntityKind, KindCheckpoint> =
        serde_json::from_str(&raw).map_err(|e| corruption(e.to_string()))?;
    file.remove(&kind)
        .map(Some)
        .ok_or_else(|| corruption(format!("no entry for {}", kind)))
}
