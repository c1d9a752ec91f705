//! # raftlog-storage
//!
//! why: provide durable stores the raft log manager can recover from and compact into
//! relations: implements raftlog-core's Storage and CompactableStorage traits
//! what: InMemoryStorage for testing, FileStorage persisting json under a directory

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use raftlog_core::{
    CompactableStorage, ConfState, Entry, HardState, RaftState, Result, Snapshot,
    SnapshotMetadata, Storage, StorageError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

// -- shared log state --

/// what both stores keep: the compaction point, the entries after it, and
/// the latest state machine snapshot
#[derive(Debug, Clone, Default)]
struct LogState {
    hard_state: HardState,
    conf_state: ConfState,
    /// index and term of the last entry folded away by compaction
    compacted_index: u64,
    compacted_term: u64,
    /// entries starting at `compacted_index + 1`
    entries: Vec<Entry>,
    snapshot: Snapshot,
}

impl LogState {
    fn first_index(&self) -> u64 {
        self.compacted_index + 1
    }

    fn last_index(&self) -> u64 {
        self.compacted_index + self.entries.len() as u64
    }

    fn initial_state(&self) -> RaftState {
        RaftState {
            hard_state: self.hard_state,
            conf_state: self.conf_state.clone(),
        }
    }

    fn term(&self, idx: u64) -> std::result::Result<u64, StorageError> {
        if idx < self.compacted_index {
            return Err(StorageError::Compacted);
        }
        if idx == self.compacted_index {
            return Ok(self.compacted_term);
        }
        if idx > self.last_index() {
            return Err(StorageError::Unavailable);
        }
        Ok(self.entries[(idx - self.first_index()) as usize].term)
    }

    fn entries(&self, lo: u64, hi: u64) -> std::result::Result<Vec<Entry>, StorageError> {
        if lo <= self.compacted_index {
            return Err(StorageError::Compacted);
        }
        if hi > self.last_index() + 1 {
            return Err(StorageError::Unavailable);
        }
        if lo >= hi {
            return Ok(Vec::new());
        }
        let first = self.first_index();
        Ok(self.entries[(lo - first) as usize..(hi - first) as usize].to_vec())
    }

    /// entries already folded into the compaction point are skipped, an
    /// overlapping suffix replaces what is stored from its first index on
    fn append(&mut self, ents: &[Entry]) -> std::result::Result<(), StorageError> {
        let first = self.first_index();
        let ents = match ents.first() {
            Some(e) if e.index < first => &ents[((first - e.index) as usize).min(ents.len())..],
            _ => ents,
        };
        let Some(head) = ents.first() else {
            return Ok(());
        };
        if head.index > self.last_index() + 1 {
            return Err(StorageError::Other(format!(
                "missing log entries [last index {}, append at {}]",
                self.last_index(),
                head.index
            )));
        }
        self.entries.truncate((head.index - first) as usize);
        self.entries.extend_from_slice(ents);
        Ok(())
    }

    fn compact(&mut self, index: u64) -> std::result::Result<(), StorageError> {
        if index <= self.compacted_index {
            return Err(StorageError::Compacted);
        }
        if index > self.last_index() {
            return Err(StorageError::Unavailable);
        }
        let term = self.term(index)?;
        self.entries.drain(..(index - self.compacted_index) as usize);
        self.compacted_index = index;
        self.compacted_term = term;
        Ok(())
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> std::result::Result<(), StorageError> {
        let index = snapshot.index();
        if index <= self.compacted_index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        self.entries.clear();
        self.compacted_index = index;
        self.compacted_term = snapshot.term();
        self.hard_state.commit = self.hard_state.commit.max(index);
        self.conf_state = snapshot.metadata.conf_state.clone();
        self.snapshot = snapshot;
        Ok(())
    }

    fn create_snapshot(
        &mut self,
        index: u64,
        data: Vec<u8>,
    ) -> std::result::Result<Snapshot, StorageError> {
        if index <= self.snapshot.index() {
            return Err(StorageError::SnapshotOutOfDate);
        }
        let term = self.term(index)?;
        self.snapshot = Snapshot {
            metadata: SnapshotMetadata {
                index,
                term,
                conf_state: self.conf_state.clone(),
            },
            data,
        };
        Ok(self.snapshot.clone())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: LogState,
}

impl InMemoryStorage {
    /// create a new, empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// create a storage holding `entries` (indices starting at 1)
    pub fn with_entries(entries: &[Entry]) -> Result<Self> {
        let mut storage = Self::new();
        storage.append(entries)?;
        Ok(storage)
    }

    pub fn hard_state(&self) -> HardState {
        self.state.hard_state
    }

    pub fn set_hard_state(&mut self, hard_state: HardState) {
        self.state.hard_state = hard_state;
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.state.conf_state = conf_state;
    }

    /// persist `entries`, replacing any conflicting stored suffix
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        self.state.append(entries)?;
        Ok(())
    }

    /// replace the whole log with `snapshot`
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.state.apply_snapshot(snapshot)?;
        Ok(())
    }

    /// record state machine `data` as of `index`
    pub fn create_snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<Snapshot> {
        Ok(self.state.create_snapshot(index, data)?)
    }

    /// the latest state machine snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot.clone()
    }
}

impl Storage for InMemoryStorage {
    fn initial_state(&self) -> Result<RaftState> {
        Ok(self.state.initial_state())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.state.first_index())
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.state.last_index())
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>> {
        Ok(self.state.entries(lo, hi)?)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        Ok(self.state.term(idx)?)
    }
}

impl CompactableStorage for InMemoryStorage {
    fn compact(&mut self, index: u64) -> Result<()> {
        self.state.compact(index)?;
        Ok(())
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: hard state, conf state, compaction point, log epoch
/// - log.json: log epoch and the entries after the compaction point
/// - snapshot.json: latest state machine snapshot, metadata and data
///
/// every mutation is written through before it returns. meta.json is the
/// commit point of multi-file updates: compaction writes it before the log,
/// so a log left behind by a crash may still hold the folded prefix, which
/// open() drops. installing a snapshot bumps the epoch, so a log written
/// before the install is discarded as a whole.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    state: LogState,
    /// bumped by every snapshot install
    epoch: u64,
}

/// metadata structure persisted in meta.json
#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    hard_state: HardState,
    conf_state: ConfState,
    compacted_index: u64,
    compacted_term: u64,
    #[serde(default)]
    log_epoch: u64,
}

/// contents of log.json
#[derive(Serialize, Deserialize, Default)]
struct LogFile {
    epoch: u64,
    entries: Vec<Entry>,
}

impl FileStorage {
    /// open the storage at the given directory, recovering whatever an
    /// earlier instance persisted there.
    /// creates the directory if it doesn't exist
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StorageError::from)?;

        let meta: MetaData = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let log: LogFile = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        let snapshot: Snapshot = read_json(&dir.join(SNAPSHOT_FILE))?.unwrap_or_default();

        let entries = if log.epoch == meta.log_epoch {
            recover_entries(log.entries, meta.compacted_index)?
        } else {
            warn!(
                log_epoch = log.epoch,
                meta_epoch = meta.log_epoch,
                "discarding log written before the last snapshot install"
            );
            Vec::new()
        };

        let state = LogState {
            hard_state: meta.hard_state,
            conf_state: meta.conf_state,
            compacted_index: meta.compacted_index,
            compacted_term: meta.compacted_term,
            entries,
            snapshot,
        };
        info!(
            dir = %dir.display(),
            first_index = state.first_index(),
            last_index = state.last_index(),
            "opened file storage"
        );
        Ok(Self {
            dir,
            state,
            epoch: meta.log_epoch,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hard_state(&self) -> HardState {
        self.state.hard_state
    }

    pub fn set_hard_state(&mut self, hard_state: HardState) -> Result<()> {
        self.state.hard_state = hard_state;
        self.persist_meta()
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        self.state.conf_state = conf_state;
        self.persist_meta()
    }

    /// persist `entries`, replacing any conflicting stored suffix
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.state.append(entries)?;
        self.persist_log()
    }

    /// replace the whole log with `snapshot`
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.state.apply_snapshot(snapshot)?;
        self.epoch += 1;
        self.persist_snapshot()?;
        self.persist_meta()?;
        self.persist_log()
    }

    /// record state machine `data` as of `index`
    pub fn create_snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<Snapshot> {
        let snapshot = self.state.create_snapshot(index, data)?;
        self.persist_snapshot()?;
        Ok(snapshot)
    }

    /// the latest state machine snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot.clone()
    }

    fn persist_meta(&self) -> Result<()> {
        let meta = MetaData {
            hard_state: self.state.hard_state,
            conf_state: self.state.conf_state.clone(),
            compacted_index: self.state.compacted_index,
            compacted_term: self.state.compacted_term,
            log_epoch: self.epoch,
        };
        write_json_atomic(&self.dir, META_FILE, &meta)?;
        Ok(())
    }

    fn persist_log(&self) -> Result<()> {
        let log = LogFile {
            epoch: self.epoch,
            entries: self.state.entries.clone(),
        };
        write_json_atomic(&self.dir, LOG_FILE, &log)?;
        debug!(
            first_index = self.state.first_index(),
            last_index = self.state.last_index(),
            "persisted log file"
        );
        Ok(())
    }

    fn persist_snapshot(&self) -> Result<()> {
        write_json_atomic(&self.dir, SNAPSHOT_FILE, &self.state.snapshot)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<RaftState> {
        Ok(self.state.initial_state())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.state.first_index())
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.state.last_index())
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>> {
        Ok(self.state.entries(lo, hi)?)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        Ok(self.state.term(idx)?)
    }
}

impl CompactableStorage for FileStorage {
    fn compact(&mut self, index: u64) -> Result<()> {
        self.state.compact(index)?;
        self.persist_meta()?;
        self.persist_log()
    }
}

/// drop the prefix of a recovered log that meta.json already folded into
/// the compaction point; a log starting past it has lost entries
fn recover_entries(
    entries: Vec<Entry>,
    compacted_index: u64,
) -> std::result::Result<Vec<Entry>, StorageError> {
    let Some(head) = entries.first() else {
        return Ok(entries);
    };
    let first = compacted_index + 1;
    if head.index > first {
        return Err(StorageError::Other(format!(
            "log file starts at {} but compaction point is {}",
            head.index, compacted_index
        )));
    }
    let stale = ((first - head.index) as usize).min(entries.len());
    if stale > 0 {
        debug!(stale, compacted_index, "dropping compacted prefix of log file");
    }
    Ok(entries.into_iter().skip(stale).collect())
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// atomic write: write to temp file then rename
fn write_json_atomic<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    value: &T,
) -> std::result::Result<(), StorageError> {
    let json = serde_json::to_string_pretty(value)?;
    let temp_path = dir.join(format!("{}.tmp", name));
    let mut file = File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

/// `None` when the file has never been written
fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ents(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::new(term, i, vec![i as u8])).collect()
    }

    #[test]
    fn in_memory_storage_starts_empty() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 0);
        assert_eq!(storage.term(0).unwrap(), 0);
        assert!(storage.term(1).unwrap_err().is_unavailable());
    }

    #[test]
    fn in_memory_storage_appends_and_loads_log() {
        let mut storage = InMemoryStorage::new();
        storage.append(&ents(1..=2, 1)).unwrap();

        let log = storage.entries(1, 3).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].index, 1);
        assert_eq!(log[1].index, 2);
    }

    #[test]
    fn in_memory_storage_replaces_conflicting_suffix() {
        let mut storage = InMemoryStorage::with_entries(&ents(1..=3, 1)).unwrap();
        storage.append(&ents(2..=2, 2)).unwrap();

        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 2);
    }

    #[test]
    fn in_memory_storage_rejects_gap() {
        let mut storage = InMemoryStorage::with_entries(&ents(1..=2, 1)).unwrap();
        let err = storage.append(&ents(4..=4, 1)).unwrap_err();
        assert!(!err.is_compacted() && !err.is_unavailable());
    }

    #[test]
    fn in_memory_storage_compacts_prefix() {
        let mut storage = InMemoryStorage::with_entries(&ents(1..=5, 2)).unwrap();
        storage.compact(3).unwrap();

        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.term(3).unwrap(), 2);
        assert!(storage.term(2).unwrap_err().is_compacted());
        assert!(storage.entries(3, 5).unwrap_err().is_compacted());
        assert_eq!(storage.entries(4, 6).unwrap(), ents(4..=5, 2));
        assert!(storage.compact(3).unwrap_err().is_compacted());
        assert!(storage.compact(9).unwrap_err().is_unavailable());
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage
                .set_hard_state(HardState {
                    term: 10,
                    vote: Some(1),
                    commit: 1,
                })
                .unwrap();
            storage.append(&[Entry::new(10, 1, b"command".to_vec())]).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            let state = storage.initial_state().unwrap();
            assert_eq!(state.hard_state.term, 10);
            assert_eq!(state.hard_state.vote, Some(1));
            assert_eq!(state.hard_state.commit, 1);
            assert_eq!(storage.last_index().unwrap(), 1);
            assert_eq!(storage.entries(1, 2).unwrap()[0].data, b"command".to_vec());
        }
    }

    #[test]
    fn file_storage_truncates_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        storage.append(&ents(1..=3, 1)).unwrap();
        storage.append(&ents(2..=2, 3)).unwrap();

        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 3);
    }

    #[test]
    fn recovered_log_behind_compaction_point() {
        assert_eq!(recover_entries(ents(2..=5, 1), 3).unwrap(), ents(4..=5, 1));
        assert!(recover_entries(ents(1..=3, 1), 5).unwrap().is_empty());
        assert!(recover_entries(ents(6..=7, 1), 3).is_err());
    }
}
