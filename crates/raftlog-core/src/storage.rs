//! # storage
//!
//! why: let the log manager read stabled entries without knowing where they live
//! relations: implemented by raftlog-storage (memory, file), consumed by log.rs
//! what: Storage trait (read side), CompactableStorage trait (prefix compaction)

use crate::entry::Entry;
use crate::error::Result;
use crate::state::RaftState;

/// read access to the durable part of a raft log
///
/// this abstraction allows the same log manager to work with:
/// - in-memory stores (testing)
/// - local durable logs
/// - any other backend that can answer the five queries below
///
/// indices below `first_index()` must fail with `StorageError::Compacted`,
/// indices above `last_index()` with `StorageError::Unavailable`.
pub trait Storage {
    /// hard state and membership recorded at the last shutdown
    fn initial_state(&self) -> Result<RaftState>;

    /// smallest retrievable index (one past the last compaction point)
    fn first_index(&self) -> Result<u64>;

    /// greatest stored index, `first_index() - 1` if nothing is stored
    fn last_index(&self) -> Result<u64>;

    /// entries in the half-open range `[lo, hi)`
    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>>;

    /// term of the entry at `idx`; `first_index() - 1` answers with the
    /// term of the snapshot that replaced the compacted prefix
    fn term(&self, idx: u64) -> Result<u64>;
}

/// a store that can fold a prefix of its log into a snapshot marker
pub trait CompactableStorage: Storage {
    /// discard every entry up to and including `index`, remembering its
    /// index and term as the new compaction point
    fn compact(&mut self, index: u64) -> Result<()>;
}
