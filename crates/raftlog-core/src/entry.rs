//! # entry
//!
//! why: define the unit of replication carried by the raft log
//! relations: held in the log window by log.rs, served by storage.rs backends
//! what: Entry struct and small helpers over entry slices

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was proposed
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Opaque payload to be applied to the state machine
    pub data: Vec<u8>,
}

impl Entry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            index,
            data: data.into(),
        }
    }
}

/// checks that `entries` is sorted and gap-free, starting at `first`.
pub(crate) fn is_contiguous_from(entries: &[Entry], first: u64) -> bool {
    entries
        .iter()
        .enumerate()
        .all(|(offset, e)| e.index == first + offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_keeps_fields() {
        let e = Entry::new(3, 7, b"put k v".to_vec());
        assert_eq!(e.term, 3);
        assert_eq!(e.index, 7);
        assert_eq!(e.data, b"put k v".to_vec());
    }

    #[test]
    fn contiguity_check() {
        let ents = vec![Entry::new(1, 4, vec![]), Entry::new(1, 5, vec![])];
        assert!(is_contiguous_from(&ents, 4));
        assert!(!is_contiguous_from(&ents, 3));
        assert!(is_contiguous_from(&[], 9));

        let gap = vec![Entry::new(1, 4, vec![]), Entry::new(1, 6, vec![])];
        assert!(!is_contiguous_from(&gap, 4));
    }
}
