//! Worker registration.
//!
//! Every per-worker array in this crate (announcement slots, logs, retire
//! lists) is addressed through a dense [`WorkerId`] obtained by looking the
//! calling OS thread up in a fixed, sorted table established at construction.
//! The worker set never grows after construction (no dynamic thread-set
//! growth).

use std::thread::ThreadId;

/// A dense index in `[0, W)` naming a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// The raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A fixed table mapping OS thread IDs to dense [`WorkerId`]s.
///
/// Constructed once from a sorted list of thread IDs; every operation on a
/// structure built on top of this crate must run on one of those threads.
#[derive(Debug)]
pub struct WorkerInfo {
    ids: Vec<ThreadId>,
}

impl WorkerInfo {
    /// Build a worker table from a list of thread IDs.
    ///
    /// The list is sorted internally; duplicates are removed.
    pub fn new(mut ids: Vec<ThreadId>) -> Self {
        ids.sort();
        ids.dedup();
        WorkerInfo { ids }
    }

    /// Register the calling thread's [`std::thread::current().id()`] by
    /// building a table from an explicit slice of thread handles' IDs.
    pub fn from_ids<I: IntoIterator<Item = ThreadId>>(ids: I) -> Self {
        Self::new(ids.into_iter().collect())
    }

    /// Number of registered workers, `W`.
    #[inline]
    pub fn num_of_workers(&self) -> usize {
        self.ids.len()
    }

    /// The [`WorkerId`] of the calling thread.
    ///
    /// Returns `WorkerId(0)` if the calling thread is not registered; callers
    /// are responsible for ensuring every thread that touches a structure was
    /// included in the worker list at construction.
    pub fn current_worker_id(&self) -> WorkerId {
        let tid = std::thread::current().id();
        match self.ids.binary_search(&tid) {
            Ok(i) => WorkerId(i),
            Err(_) => WorkerId(0),
        }
    }

    /// Look up the worker id for an arbitrary thread id, used by helpers that
    /// need to impersonate another worker.
    pub fn worker_id_of(&self, tid: ThreadId) -> WorkerId {
        match self.ids.binary_search(&tid) {
            Ok(i) => WorkerId(i),
            Err(_) => WorkerId(0),
        }
    }

    /// Fetch `array[currentWorkerId()]`.
    ///
    /// # Panics
    ///
    /// Panics if `array.len() != self.num_of_workers()` — a per-worker array
    /// size mismatch is a programming error, not a runtime failure.
    pub fn take_out<'a, T>(&self, array: &'a [T]) -> &'a T {
        assert_eq!(
            array.len(),
            self.num_of_workers(),
            "per-worker array size mismatch"
        );
        &array[self.current_worker_id().index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ThreadId> {
        let mut v = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..n {
            handles.push(std::thread::spawn(|| std::thread::current().id()));
        }
        for h in handles {
            v.push(h.join().unwrap());
        }
        v
    }

    #[test]
    fn unregistered_thread_maps_to_zero() {
        let info = WorkerInfo::new(ids(3));
        assert_eq!(info.current_worker_id(), WorkerId(0));
    }

    #[test]
    fn num_of_workers_matches_input_after_dedup() {
        let mut v = ids(2);
        let dup = v[0];
        v.push(dup);
        let info = WorkerInfo::new(v);
        assert_eq!(info.num_of_workers(), 2);
    }

    #[test]
    fn take_out_indexes_by_current_worker() {
        let info = WorkerInfo::new(vec![std::thread::current().id()]);
        let arr = [100usize];
        assert_eq!(*info.take_out(&arr), 100);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn take_out_panics_on_size_mismatch() {
        let info = WorkerInfo::new(ids(2));
        let arr = [1usize];
        let _ = info.take_out(&arr);
    }
}
