//! Per-connection state and the descriptor-indexed connection table.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::{Mutex, RwLock};

use crate::buffer::CircBuf;
use crate::demux::WatcherId;

/// Output-side state. Everything here — the ring, the DIRECT/BUFFERED flag,
/// and write-watcher scheduling — is observed and mutated only under the
/// connection's output lock.
pub(crate) struct OutputState {
    pub ring: CircBuf,
    /// When true, responses must be copied into the output ring instead of
    /// written directly. Flips on under a short write, off when the write
    /// watcher drains the ring.
    pub buffered: bool,
}

/// One connection record per active descriptor.
///
/// Created on first accept of its descriptor number; a logically closed
/// record keeps its table slot and is re-initialized when the kernel reuses
/// the descriptor.
pub(crate) struct Conn {
    /// The kernel socket handle; also the key into the connection table.
    pub fd: RawFd,
    /// Input ring. Leader exclusion means at most one thread reads a
    /// connection at a time; the lock makes that guarantee sound.
    pub input: Mutex<CircBuf>,
    pub output: Mutex<OutputState>,
    /// False after close. Prevents re-arming a dead descriptor.
    pub schedulable: AtomicBool,
}

impl Conn {
    fn new(fd: RawFd, buffer_size: usize) -> Self {
        Conn {
            fd,
            input: Mutex::new(CircBuf::new(buffer_size)),
            output: Mutex::new(OutputState {
                ring: CircBuf::new(buffer_size),
                buffered: false,
            }),
            schedulable: AtomicBool::new(false),
        }
    }

    pub fn read_watcher(&self) -> WatcherId {
        WatcherId::read(self.fd)
    }

    pub fn write_watcher(&self) -> WatcherId {
        WatcherId::write(self.fd)
    }
}

/// Dense array of connection records indexed by descriptor number.
///
/// Lookups on the event fast path take only the read lock; the write lock is
/// held only while the table doubles to fit a new descriptor. Slots are
/// never released before shutdown, so a published record stays valid for the
/// process lifetime. Worst-case growth is bounded by RLIMIT_NOFILE, since
/// descriptor numbers never exceed it.
pub(crate) struct ConnTable {
    slots: RwLock<Vec<Option<Arc<Conn>>>>,
    buffer_size: usize,
}

impl ConnTable {
    pub fn new(initial_size: usize, buffer_size: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(initial_size, || None);
        ConnTable {
            slots: RwLock::new(slots),
            buffer_size,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.slots.read().get(fd as usize).and_then(Clone::clone)
    }

    /// Return the record for `fd`, growing the table and allocating a fresh
    /// record as needed.
    pub fn get_or_create(&self, fd: RawFd) -> Arc<Conn> {
        let index = fd as usize;
        {
            let slots = self.slots.read();
            if let Some(Some(conn)) = slots.get(index) {
                return conn.clone();
            }
        }

        let mut slots = self.slots.write();
        if index >= slots.len() {
            // Keep doubling until the descriptor fits.
            let mut new_size = slots.len() * 2;
            while new_size <= index {
                new_size *= 2;
            }
            slots.resize_with(new_size, || None);
        }
        slots[index]
            .get_or_insert_with(|| Arc::new(Conn::new(fd, self.buffer_size)))
            .clone()
    }

    /// Every allocated record, for shutdown teardown.
    pub fn snapshot(&self) -> Vec<Arc<Conn>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn creates_and_reuses_records() {
        let table = ConnTable::new(4, 4096);
        let first = table.get_or_create(2);
        let again = table.get_or_create(2);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.fd, 2);
        assert!(!first.schedulable.load(Ordering::Acquire));
    }

    #[test]
    fn grows_by_doubling() {
        let table = ConnTable::new(4, 4096);
        let conn = table.get_or_create(21);
        assert_eq!(conn.fd, 21);
        // 4 -> 8 -> 16 -> 32.
        assert_eq!(table.slots.read().len(), 32);
        // Existing entries survive the growth.
        let low = table.get_or_create(1);
        assert_eq!(low.fd, 1);
    }

    #[test]
    fn get_misses_unallocated_slots() {
        let table = ConnTable::new(4, 4096);
        assert!(table.get(3).is_none());
        assert!(table.get(100).is_none());
        table.get_or_create(3);
        assert!(table.get(3).is_some());
    }

    #[test]
    fn snapshot_lists_allocated_records() {
        let table = ConnTable::new(8, 4096);
        table.get_or_create(1);
        table.get_or_create(5);
        let all = table.snapshot();
        let mut fds: Vec<_> = all.iter().map(|c| c.fd).collect();
        fds.sort_unstable();
        assert_eq!(fds, vec![1, 5]);
    }
}
