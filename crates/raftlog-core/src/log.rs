//! # log
//!
//! why: manage the sequence of replicated entries and the boundaries that move across it
//! relations: reads stabled entries through storage.rs, driven by the consensus loop
//! what: RaftLog (entry window, stabled/committed/applied markers, pending snapshot)
//!
//! ```text
//!  snapshot/first.....applied....committed....stabled.....last
//!  --------|------------------------------------------------|
//!                            log entries
//! ```
//!
//! The log never performs I/O on its own. The caller reads the two work lists
//! (`unstable_entries`, `next_entries`), does the durable write or the state
//! machine application, then reports progress back with `stable_to` and
//! `applied_to`.

use tracing::{debug, info, warn};

use crate::config::{Config, SnapshotPolicy};
use crate::entry::{is_contiguous_from, Entry};
use crate::error::{Error, Result, StorageError};
use crate::state::Snapshot;
use crate::storage::{CompactableStorage, Storage};

/// The log manager of a single raft group.
///
/// Invariants upheld after every operation:
/// - `applied <= committed <= last_index()`
/// - `first_index - 1 <= stabled <= last_index()`
/// - the window is gap-free and starts at `first_index`
pub struct RaftLog<S: Storage> {
    /// durable store holding every stabled entry since the last snapshot
    store: S,

    /// highest index known to be replicated on a quorum
    committed: u64,

    /// highest index the state machine has been told to apply
    applied: u64,

    /// entries with index <= stabled are persisted to the store
    stabled: u64,

    /// every entry that has not been compacted, starting at `first_index`
    entries: Vec<Entry>,

    /// incoming snapshot not yet persisted and applied by the caller
    pending_snapshot: Option<Snapshot>,

    /// index the first element of `entries` has (or would have)
    first_index: u64,

    config: Config,
}

impl<S: Storage> RaftLog<S> {
    /// Recover a log from `store` with the default config.
    pub fn new(store: S) -> Result<Self> {
        Self::with_config(store, Config::default())
    }

    /// Recover a log from `store`.
    ///
    /// The window is loaded with every entry the store still holds and
    /// `applied` restarts at the compaction point. An error here means the
    /// node cannot safely participate and must not retry with the same store.
    pub fn with_config(store: S, config: Config) -> Result<Self> {
        config.validate()?;

        let state = store.initial_state()?;
        let first_index = store.first_index()?;
        let last_index = store.last_index()?;

        if first_index == 0 {
            return Err(Error::Corrupted(
                "store reports first index 0, indices start at 1".to_string(),
            ));
        }
        if last_index + 1 < first_index {
            return Err(Error::Corrupted(format!(
                "store bounds are inverted: first {} last {}",
                first_index, last_index
            )));
        }

        let entries = if first_index <= last_index {
            store.entries(first_index, last_index + 1)?
        } else {
            Vec::new()
        };
        if entries.len() as u64 != last_index + 1 - first_index
            || !is_contiguous_from(&entries, first_index)
        {
            return Err(Error::Corrupted(format!(
                "store returned {} entries for range [{}, {}]",
                entries.len(),
                first_index,
                last_index
            )));
        }

        let mut committed = state.hard_state.commit;
        if committed > last_index {
            return Err(Error::Corrupted(format!(
                "hard state commit {} is out of range [last index {}]",
                committed, last_index
            )));
        }
        if committed + 1 < first_index {
            // everything folded into the store's snapshot was committed
            warn!(
                commit = committed,
                first_index, "hard state commit lags the compaction point"
            );
            committed = first_index - 1;
        }

        info!(
            first_index,
            last_index, committed, "raft log recovered from store"
        );

        Ok(Self {
            store,
            committed,
            applied: first_index - 1,
            stabled: last_index,
            entries,
            pending_snapshot: None,
            first_index,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access for the caller's durable writes.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn stabled(&self) -> u64 {
        self.stabled
    }

    /// Index of the oldest entry the window could hold.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn pending_snapshot(&self) -> Option<&Snapshot> {
        self.pending_snapshot.as_ref()
    }

    /// Greatest index known: the last entry held, or the compaction point
    /// or pending snapshot when the window is empty.
    pub fn last_index(&self) -> u64 {
        let snap_index = self.pending_snapshot.as_ref().map_or(0, Snapshot::index);
        match self.entries.last() {
            Some(e) => e.index.max(snap_index),
            None => (self.first_index - 1).max(snap_index),
        }
    }

    pub fn last_term(&self) -> Result<u64> {
        self.term(self.last_index())
    }

    /// Term of the entry at `idx`.
    ///
    /// Fails with `Unavailable` past `last_index()` and with `Compacted` below
    /// the earliest retained or snapshotted index.
    pub fn term(&self, idx: u64) -> Result<u64> {
        if idx > self.last_index() {
            return Err(StorageError::Unavailable.into());
        }
        if let Some(e) = self.window_entry(idx) {
            return Ok(e.term);
        }
        // an unpersisted snapshot shadows whatever the store still holds
        if let Some(snap) = &self.pending_snapshot {
            if idx == snap.index() {
                return Ok(snap.term());
            }
            if idx < snap.index() {
                return Err(StorageError::Compacted.into());
            }
        }
        self.store.term(idx)
    }

    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        self.term(idx).map(|t| t == term).unwrap_or(false)
    }

    /// Whether a log ending at (`last_index`, `term`) is at least as up to
    /// date as this one.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> Result<bool> {
        let our_term = self.last_term()?;
        Ok(term > our_term || (term == our_term && last_index >= self.last_index()))
    }

    /// Entries in the half-open range `[lo, hi)`.
    ///
    /// The part below `first_index` is read from the store. An empty or
    /// inverted range yields no entries.
    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        if hi > self.last_index() + 1 {
            return Err(StorageError::Unavailable.into());
        }
        if let Some(snap) = &self.pending_snapshot {
            if lo <= snap.index() {
                return Err(StorageError::Compacted.into());
            }
        }

        let mut ents = if lo < self.first_index {
            self.store.entries(lo, hi.min(self.first_index))?
        } else {
            Vec::with_capacity((hi - lo) as usize)
        };
        if hi > self.first_index {
            let start = (lo.max(self.first_index) - self.first_index) as usize;
            let end = (hi - self.first_index) as usize;
            ents.extend_from_slice(&self.entries[start..end]);
        }
        Ok(ents)
    }

    /// Entries above `stabled` that the caller still has to persist.
    pub fn unstable_entries(&self) -> &[Entry] {
        let offset = (self.stabled + 1 - self.first_index) as usize;
        self.entries.get(offset..).unwrap_or(&[])
    }

    /// Committed entries the state machine has not applied yet.
    ///
    /// Empty while a pending snapshot waits to be applied, since those
    /// entries build on the snapshot's state. Never reads past the window.
    pub fn next_entries(&self) -> &[Entry] {
        if self.pending_snapshot.is_some() || self.entries.is_empty() {
            return &[];
        }
        let lo = (self.applied + 1).max(self.first_index);
        let hi = (self.committed + 1).min(self.first_index + self.entries.len() as u64);
        if lo >= hi {
            return &[];
        }
        let start = (lo - self.first_index) as usize;
        let mut end = (hi - self.first_index) as usize;
        if self.config.max_next_entries > 0 {
            end = end.min(start + self.config.max_next_entries);
        }
        &self.entries[start..end]
    }

    pub fn has_next_entries(&self) -> bool {
        !self.next_entries().is_empty()
    }

    /// Append `ents` to the tail of the log and return the new last index.
    ///
    /// # Panics
    ///
    /// When `ents` does not continue at `last_index() + 1` without gaps, or
    /// when terms would decrease along the log. Conflicts must be resolved
    /// with `remove_entries_after` first.
    pub fn append(&mut self, ents: &[Entry]) -> u64 {
        if ents.is_empty() {
            return self.last_index();
        }
        let expected = self.last_index() + 1;
        assert!(
            is_contiguous_from(ents, expected),
            "non-contiguous append: expected entries starting at {}, got {}..={}",
            expected,
            ents[0].index,
            ents[ents.len() - 1].index
        );
        let mut prev_term = self
            .entries
            .last()
            .map(|e| e.term)
            .or_else(|| self.pending_snapshot.as_ref().map(Snapshot::term))
            .unwrap_or(0);
        for e in ents {
            assert!(
                e.term >= prev_term,
                "term regresses at index {}: {} < {}",
                e.index,
                e.term,
                prev_term
            );
            prev_term = e.term;
        }

        self.entries.extend_from_slice(ents);
        debug!(
            first = ents[0].index,
            last = self.last_index(),
            "appended entries"
        );
        self.last_index()
    }

    /// Drop every entry with index >= `lo`.
    ///
    /// `stabled` is pulled down to `lo - 1`: whatever entry later occupies
    /// those indices has not been persisted.
    ///
    /// # Panics
    ///
    /// When `lo` would discard a committed entry.
    pub fn remove_entries_after(&mut self, lo: u64) {
        assert!(
            lo > self.committed,
            "cannot remove entry {} at or below committed {}",
            lo,
            self.committed
        );
        self.stabled = self.stabled.min(lo - 1);
        let offset = (lo - self.first_index) as usize;
        if offset >= self.entries.len() {
            return;
        }
        debug!(
            from = lo,
            removed = self.entries.len() - offset,
            stabled = self.stabled,
            "truncating conflicting entries"
        );
        self.entries.truncate(offset);
    }

    /// Index of the first entry in `ents` that disagrees with this log, or
    /// the first one past its end. 0 when every entry is already present.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    debug!(
                        index = e.index,
                        term = e.term,
                        "found conflicting entry"
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Follower side of AppendEntries.
    ///
    /// Returns `None` when the entry at `prev_index` does not carry
    /// `prev_term`. Otherwise truncates the first conflicting suffix, appends
    /// what is new, follows the leader's commit and returns the index of the
    /// last entry the leader sent.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        ents: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }
        let last_new = prev_index + ents.len() as u64;

        // committed entries match the leader's by the log-matching property
        let skip = ents
            .iter()
            .take_while(|e| e.index <= self.committed)
            .count();
        let ents = &ents[skip..];

        let conflict = self.find_conflict(ents);
        if conflict != 0 {
            if conflict <= self.last_index() {
                self.remove_entries_after(conflict);
            }
            let start = (conflict - ents[0].index) as usize;
            self.append(&ents[start..]);
        }
        let commit = leader_commit.min(last_new);
        if commit > self.committed {
            self.commit_to(commit);
        }
        Some(last_new)
    }

    /// Advance `stabled` after the caller persisted entries up to `index`.
    ///
    /// # Panics
    ///
    /// When `index` is past `last_index()`.
    pub fn stable_to(&mut self, index: u64) {
        if index <= self.stabled {
            if index < self.stabled {
                warn!(
                    index,
                    stabled = self.stabled,
                    "ignoring request to move stabled backwards"
                );
            }
            return;
        }
        assert!(
            index <= self.last_index(),
            "stable index {} is out of range [last index {}]",
            index,
            self.last_index()
        );
        self.stabled = index;
    }

    /// Advance `committed` after a quorum acknowledged entries up to `index`.
    ///
    /// # Panics
    ///
    /// When `index` is past `last_index()`.
    pub fn commit_to(&mut self, index: u64) {
        if index <= self.committed {
            if index < self.committed {
                warn!(
                    index,
                    committed = self.committed,
                    "ignoring request to move committed backwards"
                );
            }
            return;
        }
        assert!(
            index <= self.last_index(),
            "commit index {} is out of range [last index {}]",
            index,
            self.last_index()
        );
        debug!(from = self.committed, to = index, "advancing committed");
        self.committed = index;
    }

    /// Leader side commit: only entries of the leader's own `term` are
    /// committed by counting replicas.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed && self.match_term(max_index, term) {
            self.commit_to(max_index);
            return true;
        }
        false
    }

    /// Advance `applied` after the state machine applied entries up to `index`.
    ///
    /// # Panics
    ///
    /// When `index` is below `applied` or above `committed`.
    pub fn applied_to(&mut self, index: u64) {
        assert!(
            index >= self.applied && index <= self.committed,
            "applied index {} is out of range [applied {}, committed {}]",
            index,
            self.applied,
            self.committed
        );
        self.applied = index;
    }

    /// Install `snapshot` received out of band; the window restarts after it.
    ///
    /// # Panics
    ///
    /// When the snapshot is older than `committed`.
    pub fn restore(&mut self, snapshot: Snapshot) {
        let index = snapshot.index();
        assert!(
            index >= self.committed,
            "snapshot index {} is older than committed {}",
            index,
            self.committed
        );
        info!(
            index,
            term = snapshot.term(),
            committed = self.committed,
            "restoring log from snapshot"
        );
        self.entries.clear();
        self.first_index = index + 1;
        self.committed = index;
        self.stabled = index;
        self.pending_snapshot = Some(snapshot);
    }

    /// The caller persisted the pending snapshot at `index` and rebuilt the
    /// state machine from it.
    pub fn snapshot_applied(&mut self, index: u64) {
        match &self.pending_snapshot {
            Some(snap) if snap.index() == index => {
                self.pending_snapshot = None;
                self.applied = self.applied.max(index);
                debug!(index, "pending snapshot applied");
            }
            Some(snap) => warn!(
                index,
                pending = snap.index(),
                "ignoring applied report for a different snapshot"
            ),
            None => warn!(index, "no pending snapshot to apply"),
        }
    }

    fn window_entry(&self, idx: u64) -> Option<&Entry> {
        if idx < self.first_index {
            return None;
        }
        self.entries.get((idx - self.first_index) as usize)
    }
}

impl<S: CompactableStorage> RaftLog<S> {
    /// Fold the applied prefix into a store snapshot once the policy
    /// threshold is reached. Returns the new compaction point, if any.
    ///
    /// Only entries that are both applied and stabled are compacted, so
    /// `first_index` never passes `applied + 1`.
    pub fn maybe_compact(&mut self) -> Result<Option<u64>> {
        let threshold = match self.config.snapshot_policy {
            SnapshotPolicy::Disabled => return Ok(None),
            SnapshotPolicy::LogsSinceLast(n) => n,
        };
        if self.pending_snapshot.is_some() {
            return Ok(None);
        }
        let compact_index = self.applied.min(self.stabled);
        if compact_index < self.first_index {
            return Ok(None);
        }
        let retained = compact_index + 1 - self.first_index;
        if retained < threshold {
            return Ok(None);
        }

        self.store.compact(compact_index)?;
        self.entries.drain(..retained as usize);
        self.first_index = compact_index + 1;
        info!(
            compact_index,
            dropped = retained,
            remaining = self.entries.len(),
            "compacted raft log"
        );
        Ok(Some(compact_index))
    }
}
