//! Connection slot table.
//!
//! A growable table of slots, a FIFO free-list and the timeout index, all
//! guarded by one mutex in the server. Invariants:
//!
//! - a slot holds at most one live connection;
//! - a slot has a timeout entry iff it holds a connection;
//! - free-list indices and occupied indices partition `0..len`.
//!
//! Capacity starts at [`RESERVED_SLOTS`], doubles on exhaustion and is
//! clamped to `max_connections`; it never shrinks. The free-list is FIFO
//! so a just-freed index is not immediately reissued.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::Connection;
use crate::timeout::{TimeoutIndex, TimeoutKey};

pub(crate) const RESERVED_SLOTS: usize = 100;

#[derive(Default)]
struct Slot {
    conn: Option<Arc<Connection>>,
    deadline: Option<TimeoutKey>,
}

pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    timeouts: TimeoutIndex,
    max_connections: u32,
}

impl SlotTable {
    pub fn new(max_connections: u32) -> Self {
        let initial = RESERVED_SLOTS.min(max_connections as usize);
        let mut slots = Vec::with_capacity(initial);
        let mut free = VecDeque::with_capacity(initial);
        for i in 0..initial {
            slots.push(Slot::default());
            free.push_back(i as u32);
        }
        SlotTable {
            slots,
            free,
            timeouts: TimeoutIndex::default(),
            max_connections,
        }
    }

    /// Reserve a slot index, growing the table if permitted.
    /// `None` means the connection cap is reached.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.free.is_empty() {
            let len = self.slots.len();
            if len >= self.max_connections as usize {
                return None;
            }
            let target = (len * 2).min(self.max_connections as usize);
            for i in len..target {
                self.slots.push(Slot::default());
                self.free.push_back(i as u32);
            }
        }
        self.free.pop_front()
    }

    /// Return an allocated-but-never-installed index to the free-list.
    pub fn release(&mut self, index: u32) {
        debug_assert!(self.slots[index as usize].conn.is_none());
        self.free.push_back(index);
    }

    pub fn install(&mut self, index: u32, conn: Arc<Connection>, deadline: u64) {
        let key = self.timeouts.insert(deadline, index);
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.conn.is_none());
        slot.conn = Some(conn);
        slot.deadline = Some(key);
    }

    /// Clear the slot and return its connection for teardown outside the
    /// lock. No-op on an already-empty slot.
    pub fn evict(&mut self, index: u32) -> Option<Arc<Connection>> {
        let slot = self.slots.get_mut(index as usize)?;
        let conn = slot.conn.take()?;
        if let Some(key) = slot.deadline.take() {
            self.timeouts.remove(key);
        }
        self.free.push_back(index);
        Some(conn)
    }

    /// Push the slot's idle deadline out. No-op on an empty slot.
    pub fn refresh(&mut self, index: u32, deadline: u64) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if slot.conn.is_none() {
            return;
        }
        if let Some(key) = slot.deadline.take() {
            self.timeouts.remove(key);
        }
        slot.deadline = Some(self.timeouts.insert(deadline, index));
    }

    /// Evict every connection whose deadline is at or before `now`, in
    /// ascending deadline order.
    pub fn take_expired(&mut self, now: u64) -> Vec<(u32, Arc<Connection>)> {
        let indices = self.timeouts.expired(now);
        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(conn) = self.evict(index) {
                out.push((index, conn));
            }
        }
        out
    }

    pub fn lookup(&self, index: u32) -> Option<Arc<Connection>> {
        self.slots.get(index as usize)?.conn.clone()
    }

    /// Take every live connection and reset the table. Shutdown only.
    pub fn drain_all(&mut self) -> Vec<Arc<Connection>> {
        let conns = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                slot.deadline = None;
                slot.conn.take()
            })
            .collect();
        self.timeouts.clear();
        self.free.clear();
        self.slots.clear();
        conns
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    pub fn timeout_entries(&self) -> usize {
        self.timeouts.len()
    }
}
