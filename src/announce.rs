//! Write announcements — ABA hazard publication for [`crate::tag`].
//!
//! Before a worker attempts a tagged CAS on a shared location it publishes
//! `(location identity, counter)` here. A concurrent writer about to choose
//! the *same* counter value for the *same* location can see the
//! announcement and pick a different one instead, which is how [`Tag::cas`]
//! defeats ABA without a fixed upper bound on concurrent writers.
//!
//! [`Tag::cas`]: crate::tag::Tag::cas

use std::sync::atomic::{AtomicU64, Ordering};

use crate::worker::WorkerInfo;

const CACHE_LINE: usize = 64;
const STRIDE: usize = CACHE_LINE / std::mem::size_of::<AtomicU64>();

/// Sentinel meaning "no announcement in this slot".
pub const EMPTY: u64 = u64::MAX;

/// Per-worker, cache-line-strided table of announced `(addr, counter)` tags.
#[derive(Debug)]
pub struct WriteAnnouncements {
    slots: Vec<AtomicU64>,
}

impl WriteAnnouncements {
    /// Build a table with one slot per worker in `info`.
    pub fn new(info: &WorkerInfo) -> Self {
        let w = info.num_of_workers();
        let mut slots = Vec::with_capacity(w * STRIDE);
        for _ in 0..w * STRIDE {
            slots.push(AtomicU64::new(EMPTY));
        }
        WriteAnnouncements { slots }
    }

    fn index(&self, worker: usize) -> usize {
        worker * STRIDE
    }

    /// Publish the calling worker's intended tag.
    pub fn set(&self, worker: usize, tag: u64) {
        self.slots[self.index(worker)].store(tag, Ordering::Release);
    }

    /// Clear the calling worker's announcement.
    pub fn clear(&self, worker: usize) {
        self.slots[self.index(worker)].store(EMPTY, Ordering::Release);
    }

    /// Snapshot every worker's currently announced tag (`EMPTY` if none).
    ///
    /// Bounded by `W`; used by [`crate::tag::Tag::next_counter`]'s escalation
    /// scan.
    pub fn scan(&self) -> Vec<u64> {
        let w = self.slots.len() / STRIDE;
        (0..w)
            .map(|i| self.slots[self.index(i)].load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerInfo;

    fn info(w: usize) -> WorkerInfo {
        WorkerInfo::new((0..w).map(|_| std::thread::current().id()).collect())
    }

    #[test]
    fn fresh_table_is_all_empty() {
        let a = WriteAnnouncements::new(&info(1));
        assert!(a.scan().iter().all(|&t| t == EMPTY));
    }

    #[test]
    fn set_then_scan_observes_tag() {
        let a = WriteAnnouncements::new(&info(2));
        a.set(1, 0xABCD);
        let snap = a.scan();
        assert_eq!(snap[1], 0xABCD);
        assert_eq!(snap[0], EMPTY);
    }

    #[test]
    fn clear_resets_to_empty() {
        let a = WriteAnnouncements::new(&info(1));
        a.set(0, 7);
        a.clear(0);
        assert_eq!(a.scan()[0], EMPTY);
    }
}
