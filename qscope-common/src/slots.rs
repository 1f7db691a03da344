//! Fixed-slot correlation arena
//!
//! An open-addressing table of `N` preallocated records indexed by a hash of
//! the thread id. It never grows: an insert into a full table fails with
//! `-E2BIG`, the same errno a full BPF hash map returns. Used where the kernel
//! map is not available (simulated targets, tests).

use crate::probe::CorrelationStore;
use crate::{is_stale, PendingQuery};

const E2BIG: i64 = 7;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Occupied(u32),
    /// Removed; lookups continue past it, inserts may reuse it
    Tombstone,
}

pub struct SlotTable<const N: usize> {
    slots: [Slot; N],
    records: [PendingQuery; N],
    len: usize,
}

impl<const N: usize> Default for SlotTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SlotTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: [Slot::Empty; N], records: [PendingQuery::zeroed(); N], len: 0 }
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Remove every record started more than `max_age_ns` before `now_ns`
    ///
    /// Returns the number of records evicted.
    pub fn evict_stale(&mut self, now_ns: u64, max_age_ns: u64) -> usize {
        let mut evicted = 0;
        for i in 0..N {
            if matches!(self.slots[i], Slot::Occupied(_))
                && is_stale(self.records[i].started_ns(), now_ns, max_age_ns)
            {
                self.slots[i] = Slot::Tombstone;
                self.len -= 1;
                evicted += 1;
            }
        }
        evicted
    }

    fn home(key: u32) -> usize {
        // Fibonacci hashing spreads sequential thread ids
        (key.wrapping_mul(0x9E37_79B9) as usize) % N
    }

    fn find(&self, key: u32) -> Option<usize> {
        let start = Self::home(key);
        for step in 0..N {
            let i = (start + step) % N;
            match self.slots[i] {
                Slot::Empty => return None,
                Slot::Occupied(k) if k == key => return Some(i),
                _ => {}
            }
        }
        None
    }

    fn free_slot(&self, key: u32) -> Option<usize> {
        let start = Self::home(key);
        (0..N).map(|step| (start + step) % N).find(|&i| !matches!(self.slots[i], Slot::Occupied(_)))
    }
}

impl<const N: usize> CorrelationStore for SlotTable<N> {
    fn insert(&mut self, key: u32, record: &PendingQuery) -> Result<(), i64> {
        let index = match self.find(key) {
            Some(i) => i,
            None => {
                let i = self.free_slot(key).ok_or(-E2BIG)?;
                self.slots[i] = Slot::Occupied(key);
                self.len += 1;
                i
            }
        };
        self.records[index] = *record;
        Ok(())
    }

    fn get_mut(&mut self, key: u32) -> Option<&mut PendingQuery> {
        let index = self.find(key)?;
        Some(&mut self.records[index])
    }

    fn remove(&mut self, key: u32) {
        if let Some(i) = self.find(key) {
            self.slots[i] = Slot::Tombstone;
            self.len -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_at(ns: u64) -> PendingQuery {
        let mut record = PendingQuery::zeroed();
        record.event.timestamp_ns = ns;
        record
    }

    #[test]
    fn test_insert_overwrites_same_key() {
        let mut table = SlotTable::<4>::new();
        table.insert(7, &started_at(1)).unwrap();
        table.insert(7, &started_at(2)).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get_mut(7).unwrap().started_ns(), 2);
    }

    #[test]
    fn test_full_table_rejects_new_keys() {
        let mut table = SlotTable::<2>::new();
        table.insert(1, &started_at(1)).unwrap();
        table.insert(2, &started_at(2)).unwrap();

        assert_eq!(table.insert(3, &started_at(3)), Err(-E2BIG));
        // Existing keys can still be updated
        assert!(table.insert(2, &started_at(5)).is_ok());
    }

    #[test]
    fn test_remove_keeps_colliding_keys_reachable() {
        let mut table = SlotTable::<3>::new();
        for key in 0..3 {
            table.insert(key, &started_at(u64::from(key))).unwrap();
        }
        table.remove(0);

        assert!(table.get_mut(0).is_none());
        assert_eq!(table.get_mut(1).unwrap().started_ns(), 1);
        assert_eq!(table.get_mut(2).unwrap().started_ns(), 2);

        // The tombstone is reused
        table.insert(9, &started_at(9)).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_evict_stale() {
        let mut table = SlotTable::<8>::new();
        table.insert(1, &started_at(100)).unwrap();
        table.insert(2, &started_at(900)).unwrap();

        assert_eq!(table.evict_stale(1_000, 500), 1);
        assert!(table.get_mut(1).is_none());
        assert!(table.get_mut(2).is_some());
    }
}
