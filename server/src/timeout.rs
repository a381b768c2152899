//! Deadline index for idle-connection eviction.
//!
//! An ordered multi-map from deadline (unix seconds) to slot index.
//! Entries with equal deadlines are disambiguated by an insertion
//! sequence number, which also serves as the stable removal key handed
//! back to the slot. Tie order among equal deadlines is unspecified.

use std::collections::BTreeMap;

/// Stable handle to one index entry, stored in the owning slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutKey {
    deadline: u64,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimeoutIndex {
    entries: BTreeMap<(u64, u64), u32>,
    seq: u64,
}

impl TimeoutIndex {
    pub fn insert(&mut self, deadline: u64, index: u32) -> TimeoutKey {
        self.seq += 1;
        let key = TimeoutKey {
            deadline,
            seq: self.seq,
        };
        self.entries.insert((key.deadline, key.seq), index);
        key
    }

    pub fn remove(&mut self, key: TimeoutKey) {
        self.entries.remove(&(key.deadline, key.seq));
    }

    /// Slot indices whose deadline is at or before `now`, in ascending
    /// deadline order.
    pub fn expired(&self, now: u64) -> Vec<u32> {
        self.entries
            .range(..=(now, u64::MAX))
            .map(|(_, &index)| index)
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
