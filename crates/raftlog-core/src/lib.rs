//! # raftlog-core
//!
//! why: keep the replicated log of a raft group consistent across appends, truncation and snapshots
//! relations: backed by raftlog-storage implementations of the Storage trait
//! what: entry and state types, error taxonomy, storage traits, config, log manager

pub mod config;
pub mod entry;
pub mod error;
pub mod log;
pub mod state;
pub mod storage;

pub use config::{Config, SnapshotPolicy};
pub use entry::Entry;
pub use error::{Error, Result, StorageError};
pub use log::RaftLog;
pub use state::{ConfState, HardState, RaftState, Snapshot, SnapshotMetadata};
pub use storage::{CompactableStorage, Storage};
