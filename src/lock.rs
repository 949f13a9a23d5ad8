//! Lock-free locks: descriptors, helping, and a plain spinning fallback.
//!
//! The helping [`Lock`] turns an ordinary critical section into a lock-free
//! one: a contending thread that finds the lock held doesn't block, it
//! *helps* — it posts the owner's thunk nowhere new (the owner already
//! posted a [`Descriptor`]) and simply runs that same descriptor itself.
//! Because every write the thunk performs goes through the descriptor's own
//! [`crate::log::Log`], any number of concurrent runners (the owner plus any
//! number of helpers) produce exactly one observable effect.
//!
//! Results are carried as a single tagged `u64`, matching this crate's
//! pervasive tagged-word idiom (and `StorageId`, the public handle type, is
//! itself specified as "an opaque integer" — so map/queue operations encode
//! their richer results into this word at the call site rather than the
//! lock carrying an arbitrary `R`).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::announce::WriteAnnouncements;
use crate::backoff::Backoff;
use crate::epoch::Epoch;
use crate::log::{Log, LogArray};
use crate::malloc::Allocator;
use crate::pool::TaggedPoolImpl;
use crate::tag::Tag;
use crate::worker::WorkerInfo;

/// A posted critical section: a thunk plus the log it commits through.
pub struct Descriptor {
    func: Arc<dyn Fn(&Log) -> u64 + Send + Sync>,
    log_array: LogArray,
    epoch_num: i64,
    thread_id: usize,
}

impl Descriptor {
    fn new(epoch_num: i64, thread_id: usize, func: Arc<dyn Fn(&Log) -> u64 + Send + Sync>) -> Self {
        Descriptor {
            func,
            log_array: LogArray::new(),
            epoch_num,
            thread_id,
        }
    }

    /// Run the thunk under this descriptor's own shared log.
    fn run(&self, log: &Log) -> u64 {
        log.do_with(&self.log_array, || (self.func)(log))
    }
}

/// Shared state behind every [`Lock`] belonging to one structure instance:
/// the descriptor pool, and the per-worker "who am I helping" / "am I
/// already helping" bookkeeping that keeps impersonation consistent across
/// every lock the structure contains.
pub struct LockRuntime<A: Allocator> {
    epoch: Arc<Epoch<A>>,
    announcements: Arc<WriteAnnouncements>,
    workers: Arc<WorkerInfo>,
    descriptors: TaggedPoolImpl<Descriptor, A>,
    helping: Vec<AtomicBool>,
    impersonated_worker: Vec<AtomicUsize>,
}

impl<A: Allocator + Clone> LockRuntime<A> {
    /// Build a runtime for a worker set of size `W`.
    pub fn new(
        epoch: Arc<Epoch<A>>,
        announcements: Arc<WriteAnnouncements>,
        workers: Arc<WorkerInfo>,
    ) -> Self {
        let w = workers.num_of_workers();
        let descriptors = TaggedPoolImpl::new(epoch.clone(), workers.clone());
        LockRuntime {
            epoch,
            announcements,
            descriptors,
            helping: (0..w).map(|_| AtomicBool::new(false)).collect(),
            impersonated_worker: (0..w).map(|i| AtomicUsize::new(i)).collect(),
            workers,
        }
    }

    fn me(&self) -> usize {
        self.workers.current_worker_id().index()
    }

    fn effective_worker(&self) -> usize {
        self.impersonated_worker[self.me()].load(Ordering::Acquire)
    }
}

/// A lock-free lock: the slot holds either no descriptor (unlocked) or a
/// pointer to the currently posted [`Descriptor`], counter-tagged for ABA
/// defense.
pub struct Lock<A: Allocator> {
    state: AtomicU64,
    _marker: std::marker::PhantomData<A>,
}

impl<A: Allocator> Default for Lock<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> Lock<A> {
    /// A fresh, unlocked lock.
    pub fn new() -> Self {
        Lock {
            state: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    /// Whether some descriptor currently holds this lock.
    pub fn is_locked(&self) -> bool {
        Tag::value(self.state.load(Ordering::Acquire)) != 0
    }

    /// Whether the calling (or impersonated) worker currently holds this
    /// lock — used to detect reentrancy.
    pub fn is_self_locked(&self, rt: &LockRuntime<A>) -> bool {
        let ptr = Tag::value(self.state.load(Ordering::Acquire)) as *mut Descriptor;
        if ptr.is_null() {
            return false;
        }
        // SAFETY: a non-null lock entry always names a live, pool-owned descriptor.
        let d = unsafe { &*ptr };
        d.thread_id == rt.effective_worker()
    }

    /// Attempt to run `thunk` as this lock's critical section.
    ///
    /// If the lock is already held by the calling worker (reentrancy),
    /// `thunk` runs directly without taking the lock. Otherwise this posts
    /// (or finds an already-posted, idempotent) descriptor and either takes
    /// the lock itself or helps whoever currently holds it, looping until
    /// the descriptor it cares about is done. `try_only` bounds the attempt
    /// to a single pass, returning `None` on contention instead of looping.
    pub fn try_lock_result(
        &self,
        rt: &LockRuntime<A>,
        caller_log: &Log,
        thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync>,
        try_only: bool,
    ) -> Option<u64> {
        if self.is_self_locked(rt) {
            return Some(thunk(caller_log));
        }

        let worker = rt.me();
        // The descriptor's recorded identity must be the *effective*
        // (possibly impersonated) worker, so a later reentrant call made
        // while a helper is standing in for this descriptor's owner is
        // still recognized by `is_self_locked`. `worker` itself stays the
        // physical slot index: it only ever indexes `rt.announcements`/
        // `rt.helping`, which are per-physical-worker arrays.
        let effective = rt.effective_worker();
        loop {
            let current = self.state.load(Ordering::Acquire);
            let current_ptr = Tag::value(current) as *mut Descriptor;

            let my_epoch = rt.epoch.get_my_epoch();
            let (d_ptr, _handle) = rt
                .descriptors
                .new_obj_acquired(Descriptor::new(my_epoch, effective, thunk.clone()), caller_log);

            if let Some(_done) = rt.descriptors.done_value(d_ptr) {
                let (_, result) = rt.descriptors.done_value_result::<u64>(d_ptr).unwrap();
                return result;
            }

            let already_holds_ours = current_ptr == d_ptr;
            let lock_is_free = current_ptr.is_null();

            if already_holds_ours || lock_is_free {
                if !already_holds_ours {
                    match Tag::cas(
                        &self.state,
                        current,
                        d_ptr as u64,
                        worker,
                        &rt.announcements,
                        Some(caller_log),
                        false,
                    ) {
                        Ok(_) => {}
                        Err(_) => {
                            if try_only {
                                return None;
                            }
                            continue;
                        }
                    }
                }
                // SAFETY: d_ptr was just issued by `rt.descriptors` and is
                // kept alive (acquired) until retired below.
                let d = unsafe { &*d_ptr };
                let result = d.run(caller_log);

                let locked_raw = self.state.load(Ordering::Acquire);
                let _ = Tag::cas(
                    &self.state,
                    locked_raw,
                    0,
                    worker,
                    &rt.announcements,
                    None,
                    true,
                );
                rt.descriptors.retire_acquired_result(d_ptr, true, result);
                rt.descriptors.retire(d_ptr, caller_log);
                return Some(result);
            }

            self.help_descriptor(rt, current, false);
            if try_only {
                return None;
            }
        }
    }

    /// Run the descriptor currently posted at `entry` on behalf of its
    /// owner. Returns `false` without doing anything if another help is
    /// already in flight on this worker (and `recursive` is `false`), or if
    /// the lock has since moved on from `entry`.
    fn help_descriptor(&self, rt: &LockRuntime<A>, entry: u64, recursive: bool) -> bool {
        let me = rt.me();
        if !recursive && rt.helping[me].load(Ordering::Acquire) {
            return false;
        }
        if self.state.load(Ordering::Acquire) != entry {
            return false;
        }
        let d_ptr = Tag::value(entry) as *mut Descriptor;
        if d_ptr.is_null() {
            return false;
        }
        // SAFETY: entry names a live, pool-owned descriptor (verified above
        // to still be the lock's current entry).
        let d = unsafe { &*d_ptr };

        let saved_epoch = rt.epoch.get_my_epoch();
        let saved_impersonation = rt.impersonated_worker[me].load(Ordering::Acquire);

        rt.epoch.set_my_epoch(std::cmp::min(saved_epoch, d.epoch_num));
        rt.helping[me].store(true, Ordering::Release);
        rt.impersonated_worker[me].store(d.thread_id, Ordering::Release);
        rt.descriptors.acquire(d_ptr);

        let helper_log = Log::new();
        let result = d.run(&helper_log);

        let locked_raw = self.state.load(Ordering::Acquire);
        let _ = Tag::cas(&self.state, locked_raw, 0, me, &rt.announcements, None, true);
        rt.descriptors.retire_acquired_result(d_ptr, true, result);

        rt.impersonated_worker[me].store(saved_impersonation, Ordering::Release);
        rt.helping[me].store(false, Ordering::Release);
        rt.epoch.set_my_epoch(saved_epoch);
        true
    }
}

const OWNER_SHIFT: u32 = 32;

fn nohelp_decode(raw: u64) -> (u32, u16) {
    (raw as u32, (raw >> OWNER_SHIFT) as u16)
}

fn nohelp_encode(counter: u32, owner: u16) -> u64 {
    counter as u64 | ((owner as u64) << OWNER_SHIFT)
}

/// The no-help lock variant: a pure spinning lock using a 32-bit
/// odd-means-locked counter plus a 16-bit owning-worker id, for reentrancy
/// detection without the cost of posting and helping descriptors.
pub struct NoHelpLock {
    state: AtomicU64,
}

impl Default for NoHelpLock {
    fn default() -> Self {
        Self::new()
    }
}

impl NoHelpLock {
    /// A fresh, unlocked lock.
    pub fn new() -> Self {
        NoHelpLock {
            state: AtomicU64::new(0),
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        nohelp_decode(self.state.load(Ordering::Acquire)).0 % 2 == 1
    }

    /// Whether `worker` currently holds this lock.
    pub fn is_self_locked(&self, worker: u16) -> bool {
        let (counter, owner) = nohelp_decode(self.state.load(Ordering::Acquire));
        counter % 2 == 1 && owner == worker
    }

    /// Acquire the lock, spinning with exponential backoff. Reentrant: if
    /// `worker` already holds it, returns a non-releasing guard.
    pub fn lock(&self, worker: u16) -> NoHelpGuard<'_> {
        if self.is_self_locked(worker) {
            return NoHelpGuard {
                lock: self,
                reentrant: true,
            };
        }
        let mut backoff = Backoff::new();
        loop {
            let raw = self.state.load(Ordering::Acquire);
            let (counter, _owner) = nohelp_decode(raw);
            if counter % 2 == 0 {
                let new_raw = nohelp_encode(counter.wrapping_add(1), worker);
                if self
                    .state
                    .compare_exchange(raw, new_raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return NoHelpGuard {
                        lock: self,
                        reentrant: false,
                    };
                }
            }
            backoff.spin();
        }
    }
}

/// RAII guard for [`NoHelpLock`].
pub struct NoHelpGuard<'a> {
    lock: &'a NoHelpLock,
    reentrant: bool,
}

impl Drop for NoHelpGuard<'_> {
    fn drop(&mut self) {
        if self.reentrant {
            return;
        }
        let raw = self.lock.state.load(Ordering::Acquire);
        let (counter, owner) = nohelp_decode(raw);
        let _ = self.lock.state.compare_exchange(
            raw,
            nohelp_encode(counter.wrapping_add(1), owner),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MonotonicTimestamp;
    use crate::malloc::GlobalAllocator;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn runtime(w: usize) -> LockRuntime<GlobalAllocator> {
        let workers = Arc::new(WorkerInfo::new(
            (0..w).map(|_| std::thread::current().id()).collect(),
        ));
        let epoch = Arc::new(Epoch::new(
            workers.clone(),
            Arc::new(MonotonicTimestamp::new()),
            0,
            GlobalAllocator,
        ));
        let announcements = Arc::new(WriteAnnouncements::new(&workers));
        LockRuntime::new(epoch, announcements, workers)
    }

    #[test]
    fn single_thread_runs_thunk_exactly_once() {
        let rt = runtime(1);
        let lock = Lock::new();
        let log = Log::new();
        let calls = Arc::new(StdAtomicUsize::new(0));
        let c = calls.clone();
        let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |_log| {
            c.fetch_add(1, Ordering::SeqCst);
            7
        });
        let r = lock.try_lock_result(&rt, &log, thunk, false);
        assert_eq!(r, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn reentrant_call_runs_without_retaking_lock() {
        let rt = runtime(1);
        let lock = Lock::new();
        let log = Log::new();
        let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(|_log| {
            // A reentrant inner call on the same worker must not deadlock.
            1
        });
        let outer = thunk.clone();
        let r = lock.try_lock_result(&rt, &log, outer, false);
        assert_eq!(r, Some(1));
    }

    #[test]
    fn nohelp_lock_reentrant_on_same_worker() {
        let lock = NoHelpLock::new();
        let g1 = lock.lock(3);
        assert!(lock.is_self_locked(3));
        let g2 = lock.lock(3);
        drop(g2);
        assert!(lock.is_locked());
        drop(g1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn nohelp_lock_excludes_other_worker() {
        let lock = NoHelpLock::new();
        let _g = lock.lock(1);
        assert!(!lock.is_self_locked(2));
    }
}
