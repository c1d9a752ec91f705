//! # state
//!
//! why: describe what a durable store hands back on startup and what a snapshot carries
//! relations: returned by Storage::initial_state, installed through RaftLog::restore
//! what: HardState, ConfState, RaftState, Snapshot, SnapshotMetadata

use serde::{Deserialize, Serialize};

/// Persistent per-node raft state that must survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// latest term this node has seen
    pub term: u64,
    /// candidate voted for in `term`, if any
    pub vote: Option<u64>,
    /// highest index known to be committed
    pub commit: u64,
}

/// Group membership as last recorded by the store.
///
/// The log manager carries this opaquely; it never interprets membership.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

/// Everything `Storage::initial_state` reports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RaftState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
}

/// Position of the last entry a snapshot stands in for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// A state machine checkpoint covering every entry up to `metadata.index`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(index: u64, term: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            metadata: SnapshotMetadata {
                index,
                term,
                conf_state: ConfState::default(),
            },
            data: data.into(),
        }
    }

    pub fn index(&self) -> u64 {
        self.metadata.index
    }

    pub fn term(&self) -> u64 {
        self.metadata.term
    }
}
