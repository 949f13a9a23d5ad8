//! Epoch-reclaimed object pools.
//!
//! [`MemoryPool`] is the sole owner of every node this crate hands out: a
//! caller receives a non-owning raw pointer from [`MemoryPool::new_obj`] and
//! must return it exclusively through [`MemoryPool::retire`]. Retired
//! objects sit in one of two per-worker lists (`old`, `current`) and are
//! only actually freed once the epoch has advanced past every worker that
//! could still be reading them.
//!
//! Two flavors share this implementation via the `TAGGED` const parameter:
//! [`EpochPoolImpl`] (plain epoch reclamation) and [`TaggedPoolImpl`] (adds
//! a sticky `acquired` flag and a done/result slot, used exclusively for
//! [`crate::lock::Descriptor`] so a helper can keep a descriptor alive past
//! normal retirement while it still needs it).
//!
//! Rather than the source's 48-bit-pointer-plus-packed-flags trick, the
//! done-flag and result live as plain fields alongside the value
//! (`#[repr(C)]` keeps the value as the first field, so a pointer to the
//! value and a pointer to its [`PoolEntry`] are the same address) — an
//! explicit struct instead of bit-packing, per the crate's translation
//! convention for originally pointer-packed state.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::epoch::Epoch;
use crate::log::Log;
use crate::malloc::Allocator;
use crate::spinlock::SpinLock;
use crate::worker::WorkerInfo;

/// `update_epoch` is attempted roughly every `W * RETIRE_BATCH` retires.
const RETIRE_BATCH: usize = 10;

#[repr(C)]
struct PoolEntry<T> {
    value: T,
    acquired: AtomicBool,
    /// `0` = not done, `1` = done (failure), `2` = done (success).
    done: AtomicU8,
    result: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<T> PoolEntry<T> {
    fn new(value: T) -> Self {
        PoolEntry {
            value,
            acquired: AtomicBool::new(false),
            done: AtomicU8::new(0),
            result: Mutex::new(None),
        }
    }
}

/// Shared pool implementation. See [`EpochPoolImpl`] / [`TaggedPoolImpl`].
pub struct MemoryPool<T, A: Allocator, const TAGGED: bool> {
    epoch: Arc<Epoch<A>>,
    workers: Arc<WorkerInfo>,
    old: Vec<SpinLock<Vec<Box<PoolEntry<T>>>>>,
    current: Vec<SpinLock<Vec<Box<PoolEntry<T>>>>>,
    worker_last_epoch: Vec<AtomicU64>,
    retire_counter: AtomicUsize,
}

/// The default reclamation pool: plain epoch-gated retirement.
pub type EpochPoolImpl<T, A> = MemoryPool<T, A, false>;
/// A pool whose objects can be marked sticky (`acquire`) to outlive normal
/// retirement — used for [`crate::lock::Descriptor`].
pub type TaggedPoolImpl<T, A> = MemoryPool<T, A, true>;

impl<T, A: Allocator, const TAGGED: bool> MemoryPool<T, A, TAGGED> {
    /// Build a pool with one retire-list pair per worker in `workers`.
    pub fn new(epoch: Arc<Epoch<A>>, workers: Arc<WorkerInfo>) -> Self {
        let w = workers.num_of_workers();
        MemoryPool {
            epoch,
            workers,
            old: (0..w).map(|_| SpinLock::new(Vec::new())).collect(),
            current: (0..w).map(|_| SpinLock::new(Vec::new())).collect(),
            worker_last_epoch: (0..w).map(|_| AtomicU64::new(0)).collect(),
            retire_counter: AtomicUsize::new(0),
        }
    }

    fn worker_index(&self) -> usize {
        self.workers.current_worker_id().index()
    }

    fn value_to_entry(p: *mut T) -> *mut PoolEntry<T> {
        p as *mut PoolEntry<T>
    }

    fn entry_to_value(entry: *mut PoolEntry<T>) -> *mut T {
        entry as *mut T
    }

    /// Idempotent allocation under `log`: if another runner of the same
    /// thunk already allocated at this log position, this allocation is
    /// dropped and the winner's pointer returned instead.
    pub fn new_obj(&self, value: T, log: &Log) -> *mut T {
        let boxed = Box::into_raw(Box::new(PoolEntry::new(value)));
        let (winner, first) = log.commit_value(boxed as u64);
        if !first {
            // SAFETY: `boxed` was never published anywhere else.
            unsafe { drop(Box::from_raw(boxed)) };
        }
        Self::entry_to_value(winner as *mut PoolEntry<T>)
    }

    /// Allocate, run `init` against the freshly allocated value (outside any
    /// log — these writes are pre-publication and must not pollute the
    /// caller's replay position), then commit the resulting pointer.
    pub fn new_init(&self, mut value: T, init: impl FnOnce(&mut T), log: &Log) -> *mut T {
        init(&mut value);
        self.new_obj(value, log)
    }

    /// Retire a pointer previously issued by this pool. Appends it to the
    /// calling worker's `current` list; every `W * 10` retires triggers an
    /// epoch advance attempt, and if this worker's own epoch bookkeeping is
    /// stale, the `old` list is freed and `current` rotates into `old`.
    pub fn retire(&self, p: *mut T, log: &Log) {
        let entry_ptr = Self::value_to_entry(p);
        let (_winner, first) = log.commit_value_safe(entry_ptr as u64);
        if !first {
            return;
        }
        // SAFETY: entry_ptr was produced by `new_obj`/`new_init` on this pool
        // and this is the sole retiring commit for it (checked above).
        let boxed = unsafe { Box::from_raw(entry_ptr) };
        let idx = self.worker_index();
        self.current[idx].lock().push(boxed);

        let total = self.retire_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let batch = self.workers.num_of_workers().max(1) * RETIRE_BATCH;
        if total % batch == 0 {
            self.epoch.update_epoch();
        }

        let now = self.epoch.current();
        if self.worker_last_epoch[idx].swap(now, Ordering::AcqRel) < now {
            let mut old_list = self.old[idx].lock();
            if TAGGED {
                // Sticky objects survive until every acquirer releases them.
                old_list.retain(|e| e.acquired.load(Ordering::Acquire));
            } else {
                old_list.clear();
            }
            let mut cur_list = self.current[idx].lock();
            std::mem::swap(&mut *old_list, &mut *cur_list);
        }
    }

    /// Drop every retired object immediately, bypassing epoch safety.
    /// Intended for whole-structure teardown, not mid-flight use.
    pub fn clear(&self) {
        for list in self.old.iter().chain(self.current.iter()) {
            list.lock().clear();
        }
    }
}

impl<T, A: Allocator> MemoryPool<T, A, true> {
    /// Like [`MemoryPool::new_obj`], returning the same pointer twice: the
    /// value pointer and the stable handle later calls key off of (in this
    /// port they are the same address, since done/result bookkeeping lives
    /// alongside the value rather than in a separate log slot).
    pub fn new_obj_acquired(&self, value: T, log: &Log) -> (*mut T, *mut T) {
        let p = self.new_obj(value, log);
        (p, p)
    }

    /// Mark `p` sticky: surviving normal retirement until a matching
    /// `retire_acquired`/`retire_acquired_result` call releases it.
    pub fn acquire(&self, p: *mut T) {
        // SAFETY: p was produced by this pool and is still live.
        let entry = unsafe { &*Self::value_to_entry(p) };
        entry.acquired.store(true, Ordering::Release);
    }

    /// Record that `p` finished, with no payload result, and release its
    /// sticky hold.
    pub fn retire_acquired(&self, p: *mut T, success: bool) {
        // SAFETY: p was produced by this pool and is still live.
        let entry = unsafe { &*Self::value_to_entry(p) };
        entry.done.store(if success { 2 } else { 1 }, Ordering::Release);
        entry.acquired.store(false, Ordering::Release);
    }

    /// Like [`Self::retire_acquired`] but also stashes a typed result for
    /// later recovery via [`Self::done_value_result`].
    pub fn retire_acquired_result<R: Send + 'static>(&self, p: *mut T, success: bool, result: R) {
        // SAFETY: p was produced by this pool and is still live.
        let entry = unsafe { &*Self::value_to_entry(p) };
        *entry.result.lock().unwrap() = Some(Box::new(result));
        entry.done.store(if success { 2 } else { 1 }, Ordering::Release);
        entry.acquired.store(false, Ordering::Release);
    }

    /// Whether `p`'s descriptor has finished, and if so, whether it
    /// succeeded.
    pub fn done_value(&self, p: *mut T) -> Option<bool> {
        // SAFETY: p was produced by this pool and is still live.
        let entry = unsafe { &*Self::value_to_entry(p) };
        match entry.done.load(Ordering::Acquire) {
            0 => None,
            2 => Some(true),
            _ => Some(false),
        }
    }

    /// Like [`Self::done_value`] but also recovers the stashed result if one
    /// of type `R` was stored.
    pub fn done_value_result<R: Clone + 'static>(&self, p: *mut T) -> Option<(bool, Option<R>)> {
        let success = self.done_value(p)?;
        // SAFETY: p was produced by this pool and is still live.
        let entry = unsafe { &*Self::value_to_entry(p) };
        let guard = entry.result.lock().unwrap();
        let recovered = guard.as_ref().and_then(|b| b.downcast_ref::<R>()).cloned();
        Some((success, recovered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MonotonicTimestamp;
    use crate::malloc::GlobalAllocator;

    fn harness(w: usize) -> (Arc<Epoch<GlobalAllocator>>, Arc<WorkerInfo>) {
        let workers = Arc::new(WorkerInfo::new(
            (0..w).map(|_| std::thread::current().id()).collect(),
        ));
        let epoch = Arc::new(Epoch::new(
            workers.clone(),
            Arc::new(MonotonicTimestamp::new()),
            0,
            GlobalAllocator,
        ));
        (epoch, workers)
    }

    #[test]
    fn new_obj_then_retire_roundtrip() {
        let (epoch, workers) = harness(1);
        let pool: EpochPoolImpl<i32, GlobalAllocator> = MemoryPool::new(epoch, workers);
        let log = Log::new();
        let array = crate::log::LogArray::new();
        log.do_with(&array, || {
            let p = pool.new_obj(7, &log);
            unsafe { assert_eq!(*p, 7) };
            pool.retire(p, &log);
        });
    }

    #[test]
    fn double_retire_through_same_log_position_is_idempotent() {
        let (epoch, workers) = harness(1);
        let pool: EpochPoolImpl<i32, GlobalAllocator> = MemoryPool::new(epoch, workers);
        let log = Log::new();
        let array = crate::log::LogArray::new();
        log.do_with(&array, || {
            let p = pool.new_obj(1, &log);
            pool.retire(p, &log);
            // second "replay" of the same retire step must not double free.
            pool.retire(p, &log);
        });
    }

    #[test]
    fn tagged_pool_acquire_blocks_drop_until_released() {
        let (epoch, workers) = harness(1);
        let pool: TaggedPoolImpl<i32, GlobalAllocator> = MemoryPool::new(epoch, workers);
        let log = Log::new();
        let array = crate::log::LogArray::new();
        log.do_with(&array, || {
            let (p, _handle) = pool.new_obj_acquired(5, &log);
            pool.acquire(p);
            assert_eq!(pool.done_value(p), None);
            pool.retire_acquired_result(p, true, 99i32);
            assert_eq!(pool.done_value(p), Some(true));
            assert_eq!(pool.done_value_result::<i32>(p), Some((true, Some(99))));
        });
    }
}
