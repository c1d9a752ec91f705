//! # config
//!
//! why: tune when the log window gives memory back and how much work one batch hands out
//! relations: consumed by log.rs (maybe_compact, next_entries)
//! what: Config, SnapshotPolicy

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Applied entries retained in memory before compaction kicks in.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 1000;

/// When `maybe_compact` folds the applied prefix into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// The window keeps growing; compaction is left to the caller.
    Disabled,
    /// Compact once this many applied entries are held in the window.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// Runtime configuration for a `RaftLog`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// compaction policy for the in-memory window
    pub snapshot_policy: SnapshotPolicy,
    /// upper bound on entries returned by one `next_entries` call, 0 = unbounded
    pub max_next_entries: usize,
}

impl Config {
    /// parse a json config document and validate it
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(s).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_policy == SnapshotPolicy::LogsSinceLast(0) {
            return Err(Error::ConfigInvalid(
                "snapshot_policy LogsSinceLast must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
