//! Workspace checkpoints
//!
//! A checkpoint is a human-readable snapshot of one run (state, iteration and
//! the full context) written to `checkpoint.json` in the task workspace. Each
//! save replaces the previous file.

use sdk::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::orchestrator::OrchestrationState;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Contents of `checkpoint.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: OrchestrationState,
    pub iteration: u32,
    pub context: Context,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    filename: String,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            filename: CHECKPOINT_FILE.to_string(),
        }
    }

    pub fn path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.filename)
    }

    /// Write a checkpoint, replacing any previous one
    ///
    /// The file is written under a temporary name and renamed into place, so a
    /// reader never observes a partial checkpoint.
    pub async fn save(
        &self,
        workspace: &Path,
        state: OrchestrationState,
        iteration: u32,
        context: &Context,
    ) -> Result<PathBuf, CheckpointError> {
        let path = self.path(workspace);
        let tmp = workspace.join(format!(".{}.tmp", self.filename));

        let checkpoint = Checkpoint {
            state,
            iteration,
            context: context.clone(),
        };
        let mut payload = serde_json::to_string_pretty(&checkpoint)?;
        payload.push('\n');

        let write_err = |source| CheckpointError::Write {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(workspace).await.map_err(write_err)?;
        tokio::fs::write(&tmp, payload).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;

        info!(path = %path.display(), iteration, state = %state, "Checkpoint written");
        Ok(path)
    }

    /// Read the workspace checkpoint, if there is a readable one
    pub async fn load(&self, workspace: &Path) -> Option<Checkpoint> {
        let path = self.path(workspace);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), "Failed to read checkpoint: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable checkpoint: {}", e);
                None
            }
        }
    }
}
