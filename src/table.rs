//! The port table: an arena of discovered remote nodes, indexed by slot.
//!
//! Slot 0 is a sentinel whose "file descriptor" is the CAN bus socket itself,
//! so that the multiplexer can build one poll set out of every slot's fd
//! uniformly (see §4.4 / §9 "avoid pointer-graph designs" — this is a
//! `Vec`-backed arena keyed by slot index, not a graph of owned handles).

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::watch::WatchHandle;

pub const PINGS_BEFORE_DISCONNECT: u8 = 8;

/// One discovered remote node.
pub struct PortEntry {
    pub port_number: u16,
    pub can_id: u32,
    pub uuid: [u8; 6],
    pub master_fd: RawFd,
    pub symlink_path: PathBuf,
    pub watch_handle: WatchHandle,
    pub attached: bool,
    pub ping_credit: u8,
}

enum Slot {
    Sentinel(RawFd),
    Port(PortEntry),
}

/// The mutable registry of active virtual ports.
///
/// Invariants (checked by `check_invariants` in tests, not on every mutation —
/// the cost of re-validating on every frame would defeat the point of a flat
/// arena):
/// 1. slot 0 is never a real port.
/// 2. at most one entry per `port_number`.
/// 3. `watch_handle` and `can_id` are pairwise distinct across entries.
pub struct PortTable {
    slots: Vec<Slot>,
}

impl PortTable {
    pub fn new(bus_fd: RawFd) -> Self {
        Self {
            slots: vec![Slot::Sentinel(bus_fd)],
        }
    }

    pub fn bus_fd(&self) -> RawFd {
        match &self.slots[0] {
            Slot::Sentinel(fd) => *fd,
            Slot::Port(_) => unreachable!("slot 0 is always the sentinel"),
        }
    }

    /// Total number of slots, including the sentinel.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the sentinel always occupies slot 0
    }

    /// Number of real ports (excludes the sentinel).
    pub fn port_count(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&PortEntry> {
        if index == 0 {
            return None;
        }
        match self.slots.get(index) {
            Some(Slot::Port(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PortEntry> {
        if index == 0 {
            return None;
        }
        match self.slots.get_mut(index) {
            Some(Slot::Port(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn find_by_port_number(&self, port_number: u16) -> Option<usize> {
        self.iter_real()
            .find(|(_, e)| e.port_number == port_number)
            .map(|(i, _)| i)
    }

    pub fn find_by_can_id(&self, can_id: u32) -> Option<usize> {
        self.iter_real()
            .find(|(_, e)| e.can_id == can_id)
            .map(|(i, _)| i)
    }

    pub fn find_by_watch_handle(&self, handle: WatchHandle) -> Option<usize> {
        self.iter_real()
            .find(|(_, e)| e.watch_handle == handle)
            .map(|(i, _)| i)
    }

    pub fn find_by_master_fd(&self, fd: RawFd) -> Option<usize> {
        self.iter_real()
            .find(|(_, e)| e.master_fd == fd)
            .map(|(i, _)| i)
    }

    pub fn iter_real(&self) -> impl Iterator<Item = (usize, &PortEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            if i == 0 {
                None
            } else {
                match slot {
                    Slot::Port(entry) => Some((i, entry)),
                    Slot::Sentinel(_) => None,
                }
            }
        })
    }

    /// Appends a new entry, growing the backing storage by doubling if the
    /// table is at capacity, and returns its slot index.
    pub fn push(&mut self, entry: PortEntry) -> usize {
        if self.slots.len() == self.slots.capacity() {
            self.slots.reserve(self.slots.capacity().max(1));
        }
        self.slots.push(Slot::Port(entry));
        self.slots.len() - 1
    }

    /// Removes the entry at `index`, shifting every later slot left by one
    /// to close the gap, and returns the removed entry to the caller for
    /// resource teardown.
    ///
    /// This is the corrected "remove-and-shift" semantics from §9: a single
    /// contiguous shift of `slots[index+1..]` into `slots[index..]`, not a
    /// repeated copy from a frozen source index.
    pub fn reap(&mut self, index: usize) -> PortEntry {
        assert!(index != 0, "slot 0 is the sentinel and cannot be reaped");
        let removed = self.slots.remove(index);
        match removed {
            Slot::Port(entry) => entry,
            Slot::Sentinel(_) => unreachable!("slot 0 is excluded by the assert above"),
        }
    }

    #[cfg(test)]
    pub fn check_invariants(&self) -> bool {
        use std::collections::HashSet;

        if matches!(self.slots[0], Slot::Port(_)) {
            return false;
        }

        let mut can_ids = HashSet::new();
        let mut port_numbers = HashSet::new();
        let mut watch_handles = HashSet::new();
        let mut symlinks = HashSet::new();

        for (_, entry) in self.iter_real() {
            if !can_ids.insert(entry.can_id) {
                return false;
            }
            if !port_numbers.insert(entry.port_number) {
                return false;
            }
            if !watch_handles.insert(entry.watch_handle) {
                return false;
            }
            if !symlinks.insert(entry.symlink_path.clone()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchHandle;

    fn entry(port_number: u16, can_id: u32, watch: i32) -> PortEntry {
        PortEntry {
            port_number,
            can_id,
            uuid: [port_number as u8, 0, 0, 0, 0, 0],
            master_fd: 100 + port_number as i32,
            symlink_path: PathBuf::from(format!("/tmp/ttyCAN0_{:012x}", port_number)),
            watch_handle: WatchHandle::from(watch),
            attached: false,
            ping_credit: PINGS_BEFORE_DISCONNECT,
        }
    }

    #[test]
    fn slot_zero_is_never_a_real_port() {
        let table = PortTable::new(42);
        assert_eq!(table.bus_fd(), 42);
        assert!(table.get(0).is_none());
        assert_eq!(table.port_count(), 0);
    }

    #[test]
    fn push_and_lookup() {
        let mut table = PortTable::new(42);
        let idx = table.push(entry(7, 0x10e, 1));
        assert_eq!(idx, 1);
        assert_eq!(table.find_by_port_number(7), Some(1));
        assert_eq!(table.find_by_can_id(0x10e), Some(1));
        assert_eq!(table.find_by_watch_handle(WatchHandle::from(1)), Some(1));
        assert!(table.check_invariants());
    }

    #[test]
    fn reap_shifts_all_later_slots_left() {
        let mut table = PortTable::new(42);
        table.push(entry(1, 0x102, 1));
        table.push(entry(2, 0x104, 2));
        table.push(entry(3, 0x106, 3));
        assert_eq!(table.port_count(), 3);

        let removed = table.reap(1);
        assert_eq!(removed.port_number, 1);
        assert_eq!(table.port_count(), 2);
        // entries 2 and 3 shifted into slots 1 and 2, in order.
        assert_eq!(table.get(1).unwrap().port_number, 2);
        assert_eq!(table.get(2).unwrap().port_number, 3);
        assert!(table.check_invariants());
    }

    #[test]
    fn reap_all_slots_one_at_a_time_never_corrupts_the_table() {
        let mut table = PortTable::new(42);
        for n in 0..5u16 {
            table.push(entry(n, 0x100 + 2 * n as u32, n as i32));
        }
        while table.port_count() > 0 {
            table.reap(1);
            assert!(table.check_invariants());
        }
    }

    #[test]
    fn at_most_one_entry_per_port_number_is_enforced_by_caller_contract() {
        let mut table = PortTable::new(42);
        table.push(entry(7, 0x10e, 1));
        assert_eq!(table.find_by_port_number(7), Some(1));
        // re-discovery of the same port number is the caller's job (the
        // virtual-port factory checks find_by_port_number before pushing);
        // the table itself does not forbid a second push with the same
        // number, so callers must honor invariant 2.
    }
}
