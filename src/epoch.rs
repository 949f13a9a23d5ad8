//! Epoch-based reclamation.
//!
//! An [`Epoch`] coordinates when retired nodes are safe to actually free.
//! Each worker publishes the epoch it last observed (or `-1` when not
//! inside a structure operation) into its own announcement slot;
//! [`Epoch::update_epoch`] may only advance the global counter once every
//! announced worker is at or past it.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::malloc::Allocator;
use crate::worker::WorkerInfo;

/// Supplies a secondary, independently-advancing read-stamp used by
/// multi-version collaborators built on top of an `Epoch`. This crate's own
/// structures don't need MVCC, so [`MonotonicTimestamp`] is a sufficient
/// default; the field exists because the flock runtime's reclamation
/// bookkeeping (`done_stamp`/`prev_stamp`) is specified in terms of one.
pub trait Timestamp: Send + Sync {
    /// Fetch and advance the read stamp.
    fn get_read_stamp(&self) -> u64;
}

/// A simple monotonically increasing [`Timestamp`].
#[derive(Debug, Default)]
pub struct MonotonicTimestamp(AtomicU64);

impl MonotonicTimestamp {
    /// Start a fresh counter at zero.
    pub fn new() -> Self {
        MonotonicTimestamp(AtomicU64::new(0))
    }
}

impl Timestamp for MonotonicTimestamp {
    fn get_read_stamp(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

#[repr(align(64))]
#[derive(Debug)]
struct PaddedSlot(AtomicI64);

/// Epoch counter plus per-worker announcement table.
pub struct Epoch<A: Allocator> {
    announcement: Vec<PaddedSlot>,
    current: AtomicU64,
    done_stamp: AtomicU64,
    prev_stamp: AtomicU64,
    timestamp: Arc<dyn Timestamp>,
    workers: Arc<WorkerInfo>,
    allocator: A,
}

/// RAII guard returned conceptually by [`Epoch::with`]; unannounces on drop
/// (including on unwind), matching the "announce / run / unannounce on
/// every exit path" contract.
struct AnnounceGuard<'a, A: Allocator> {
    epoch: &'a Epoch<A>,
}

impl<'a, A: Allocator> Drop for AnnounceGuard<'a, A> {
    fn drop(&mut self) {
        self.epoch.unannounce();
    }
}

impl<A: Allocator> Epoch<A> {
    /// Build a fresh epoch over `workers`, backed by `timestamp`, with an
    /// initial `done_stamp` and an allocator handle carried for identity
    /// comparison and future pool wiring.
    pub fn new(
        workers: Arc<WorkerInfo>,
        timestamp: Arc<dyn Timestamp>,
        done_stamp_init: u64,
        allocator: A,
    ) -> Self {
        let w = workers.num_of_workers();
        let announcement = (0..w).map(|_| PaddedSlot(AtomicI64::new(-1))).collect();
        Epoch {
            announcement,
            current: AtomicU64::new(0),
            done_stamp: AtomicU64::new(done_stamp_init),
            prev_stamp: AtomicU64::new(done_stamp_init),
            timestamp,
            workers,
            allocator,
        }
    }

    /// The allocator this epoch was constructed with.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The current global epoch value.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// The most recent "safe to reclaim up to" stamp.
    #[inline]
    pub fn done_stamp(&self) -> u64 {
        self.done_stamp.load(Ordering::Acquire)
    }

    fn worker_index(&self) -> usize {
        self.workers.current_worker_id().index()
    }

    /// Publish the calling worker's entry into the current epoch.
    pub fn announce(&self) {
        let e = self.current() as i64;
        let idx = self.worker_index();
        self.announcement[idx].0.swap(e, Ordering::AcqRel);
    }

    /// Clear the calling worker's announcement.
    pub fn unannounce(&self) {
        let idx = self.worker_index();
        self.announcement[idx].0.store(-1, Ordering::Release);
    }

    /// Run `f` with the calling worker announced into the current epoch,
    /// guaranteeing `unannounce` on every exit path including unwinding.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.announce();
        let _guard = AnnounceGuard { epoch: self };
        f()
    }

    /// Attempt to advance the global epoch by one.
    ///
    /// Scans every announcement slot twice (a safety net against observing a
    /// transiently stale `-1`); advances only if every slot is unannounced
    /// or already at or past the current epoch.
    pub fn update_epoch(&self) -> bool {
        let e = self.current();
        let scan_clear = || {
            self.announcement
                .iter()
                .all(|slot| {
                    let v = slot.0.load(Ordering::Acquire);
                    v == -1 || (v as u64) >= e
                })
        };
        if !scan_clear() || !scan_clear() {
            return false;
        }
        match self
            .current
            .compare_exchange(e, e + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let new_prev = self.timestamp.get_read_stamp();
                let old_prev = self.prev_stamp.swap(new_prev, Ordering::AcqRel);
                self.done_stamp.store(old_prev, Ordering::Release);
                log::debug!("epoch advanced to {}", e + 1);
                true
            }
            Err(_) => false,
        }
    }

    /// Read the calling worker's own announced epoch (`-1` if unannounced).
    pub fn get_my_epoch(&self) -> i64 {
        let idx = self.worker_index();
        self.announcement[idx].0.load(Ordering::Acquire)
    }

    /// Overwrite the calling worker's announced epoch — used by a helper to
    /// inherit the helpee's epoch so the helpee's reads stay valid while the
    /// helper executes its thunk.
    pub fn set_my_epoch(&self, e: i64) {
        let idx = self.worker_index();
        self.announcement[idx].0.store(e, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::GlobalAllocator;

    fn epoch(w: usize) -> Epoch<GlobalAllocator> {
        let workers = Arc::new(WorkerInfo::new(
            (0..w).map(|_| std::thread::current().id()).collect(),
        ));
        Epoch::new(
            workers,
            Arc::new(MonotonicTimestamp::new()),
            0,
            GlobalAllocator,
        )
    }

    #[test]
    fn fresh_epoch_starts_at_zero_all_unannounced() {
        let e = epoch(4);
        assert_eq!(e.current(), 0);
        assert_eq!(e.get_my_epoch(), -1);
    }

    #[test]
    fn announce_then_update_epoch_advances_once_unannounced() {
        let e = epoch(1);
        e.announce();
        assert!(!e.update_epoch(), "announced worker blocks advance");
        e.unannounce();
        assert!(e.update_epoch());
        assert_eq!(e.current(), 1);
    }

    #[test]
    fn with_unannounces_on_normal_return() {
        let e = epoch(1);
        let r = e.with(|| 42);
        assert_eq!(r, 42);
        assert_eq!(e.get_my_epoch(), -1);
    }

    #[test]
    fn with_unannounces_on_panic() {
        let e = epoch(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            e.with(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(e.get_my_epoch(), -1);
    }

    #[test]
    fn done_stamp_rotates_on_advance() {
        let e = epoch(1);
        assert!(e.update_epoch());
        // prev_stamp has moved, done_stamp takes its prior value.
        assert_eq!(e.done_stamp(), 0);
    }
}
