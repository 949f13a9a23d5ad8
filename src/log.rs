//! Per-thread replayable commit log.
//!
//! A [`Log`] is the mechanism that turns "N threads racing to run the same
//! thunk" into "exactly one externally observable effect": every write a
//! thunk performs goes through [`Log::commit_value`] (or
//! [`Log::commit_value_safe`] for values that may legitimately be zero)
//! instead of directly through the underlying atomic. The first committer at
//! a given log position wins; every other runner of the same thunk — racing
//! owner and helpers alike — observes that winner's value by losing a CAS.
//!
//! Physically the log is a chain of fixed-size [`LogArray`] blocks linked by
//! an atomic `next` pointer, allocated lazily as a thunk commits more values
//! than fit in one block.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Number of atomic slots per [`LogArray`] block.
pub const LOG_LENGTH: usize = 8;

const WRITTEN_BIT: u64 = 1 << 48;
const SAFE_VALUE_MASK: u64 = WRITTEN_BIT - 1;

/// One fixed-size block of a log's slot chain.
#[derive(Debug)]
pub struct LogArray {
    entries: [AtomicU64; LOG_LENGTH],
    next: AtomicPtr<LogArray>,
}

impl Default for LogArray {
    fn default() -> Self {
        Self::new()
    }
}

impl LogArray {
    /// Build a fresh, empty block. Usable standalone (e.g. as a
    /// [`crate::lock::Descriptor`]'s own shared log head) or boxed and
    /// linked into a chain.
    pub fn new() -> LogArray {
        LogArray {
            entries: std::array::from_fn(|_| AtomicU64::new(0)),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn boxed() -> Box<LogArray> {
        Box::new(LogArray::new())
    }
}

impl Drop for LogArray {
    fn drop(&mut self) {
        // Iterative to avoid a deep recursive drop on a long chain.
        let mut next = *self.next.get_mut();
        while !next.is_null() {
            let mut boxed = unsafe { Box::from_raw(next) };
            next = *boxed.next.get_mut();
            *boxed.next.get_mut() = std::ptr::null_mut();
        }
    }
}

/// A per-thread view over a (possibly shared) chain of [`LogArray`] blocks.
///
/// Every thread owns one `Log` for its own reads; [`Log::do_with`] lets it
/// temporarily bind to a descriptor's shared chain while executing that
/// descriptor's thunk.
#[derive(Debug)]
pub struct Log {
    /// Chain this `Log` owns and will free on drop.
    owned_head: *mut LogArray,
    current: AtomicPtr<LogArray>,
    cursor: AtomicUsize,
    /// Whether a descriptor's thunk is currently bound to this log; while
    /// `false`, `commit_value` is a no-op passthrough (§4.3: "If the log is
    /// empty ... returns `(v, true)` without logging").
    active: Cell<bool>,
}

// `Log` is shared by reference across helping threads racing on the same
// descriptor's chain; all mutation goes through atomics or thread-local use.
unsafe impl Sync for Log {}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Create a fresh, empty log.
    pub fn new() -> Self {
        let head = Box::into_raw(LogArray::boxed());
        Log {
            owned_head: head,
            current: AtomicPtr::new(head),
            cursor: AtomicUsize::new(0),
            active: Cell::new(false),
        }
    }

    /// Whether no descriptor execution is currently bound to this log.
    pub fn is_empty(&self) -> bool {
        !self.active.get()
    }

    fn claim_and_commit(&self, raw: u64) -> (u64, bool) {
        loop {
            let cur_ptr = self.current.load(Ordering::Acquire);
            let cur = unsafe { &*cur_ptr };
            let slot = self.cursor.fetch_add(1, Ordering::AcqRel);
            if slot >= LOG_LENGTH {
                self.advance_block(cur_ptr, cur);
                continue;
            }
            match cur.entries[slot].compare_exchange(
                0,
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (raw, true),
                Err(existing) => return (existing, false),
            }
        }
    }

    fn advance_block(&self, cur_ptr: *mut LogArray, cur: &LogArray) {
        let mut next = cur.next.load(Ordering::Acquire);
        if next.is_null() {
            let candidate = Box::into_raw(LogArray::boxed());
            match cur.next.compare_exchange(
                std::ptr::null_mut(),
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => next = candidate,
                Err(existing) => {
                    // SAFETY: candidate was never published, we exclusively own it.
                    unsafe { drop(Box::from_raw(candidate)) };
                    next = existing;
                }
            }
        }
        let _ = self.current.compare_exchange(
            cur_ptr,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Best-effort: another racer may already have advanced the cursor
        // past this reset, which only costs a retry, never correctness.
        let _ = self
            .cursor
            .compare_exchange(self.cursor.load(Ordering::Acquire), 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Commit a non-zero value at the next log position.
    ///
    /// Returns `(committed_value, first_writer)`: `committed_value` is the
    /// value every caller should use going forward (the winner's, even if
    /// this call lost the race), and `first_writer` is `true` only for the
    /// thread whose value was actually stored.
    ///
    /// # Panics
    ///
    /// Panics if `v == 0` — use [`Log::commit_value_safe`] for values that
    /// may legitimately be zero.
    pub fn commit_value(&self, v: u64) -> (u64, bool) {
        assert_ne!(v, 0, "commit_value requires a non-zero value");
        if self.is_empty() {
            return (v, true);
        }
        self.claim_and_commit(v)
    }

    /// Like [`Log::commit_value`] but permits `v == 0` by reserving a
    /// "written" marker bit above the low 48 data bits.
    pub fn commit_value_safe(&self, v: u64) -> (u64, bool) {
        if self.is_empty() {
            return (v, true);
        }
        let encoded = (v & SAFE_VALUE_MASK) | WRITTEN_BIT;
        let (raw, first) = self.claim_and_commit(encoded);
        (raw & SAFE_VALUE_MASK, first)
    }

    /// Claim the next slot with sentinel value `1`; run `f` only if this
    /// call is the first to claim it (i.e. no other helper has already
    /// finished the corresponding step).
    pub fn skip_if_done(&self, f: impl FnOnce()) {
        if self.is_empty() {
            f();
            return;
        }
        let (_, first) = self.claim_and_commit(1);
        if first {
            f();
        }
    }

    /// Temporarily rebind this log to `array` (starting at slot 0), run `f`,
    /// then restore the previous binding. Used by a descriptor's executor to
    /// run its thunk under the descriptor's own shared log chain.
    pub fn do_with<R>(&self, array: &LogArray, f: impl FnOnce() -> R) -> R {
        let prev_current = self
            .current
            .swap(array as *const LogArray as *mut LogArray, Ordering::AcqRel);
        let prev_cursor = self.cursor.swap(0, Ordering::AcqRel);
        let prev_active = self.active.replace(true);
        let result = f();
        self.current.store(prev_current, Ordering::Release);
        self.cursor.store(prev_cursor, Ordering::Release);
        self.active.set(prev_active);
        result
    }

    /// Access the head block of this log's own (not a bound-via-`do_with`)
    /// chain — used when constructing a [`crate::lock::Descriptor`] that
    /// should share this log.
    pub fn head_array(&self) -> &LogArray {
        // SAFETY: owned_head is valid for the lifetime of `self`.
        unsafe { &*self.owned_head }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        // SAFETY: owned_head was created by this Log and never shared out
        // past its own lifetime (do_with only borrows external chains).
        unsafe { drop(Box::from_raw(self.owned_head)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_passes_through() {
        let log = Log::new();
        assert!(log.is_empty());
        assert_eq!(log.commit_value(5), (5, true));
    }

    #[test]
    fn do_with_activates_log_and_commits_sequentially() {
        let log = Log::new();
        let array = LogArray::boxed();
        log.do_with(&array, || {
            assert!(!log.is_empty());
            assert_eq!(log.commit_value(10), (10, true));
            assert_eq!(log.commit_value(20), (20, true));
        });
        assert!(log.is_empty());
    }

    #[test]
    fn second_committer_at_same_position_loses() {
        let log = Log::new();
        let array = LogArray::boxed();
        log.do_with(&array, || {
            assert_eq!(log.commit_value(10), (10, true));
        });
        // Re-enter at position 0 to simulate a second runner of the same thunk.
        log.do_with(&array, || {
            assert_eq!(log.commit_value(99), (10, false));
        });
    }

    #[test]
    fn commit_value_safe_permits_zero() {
        let log = Log::new();
        let array = LogArray::boxed();
        log.do_with(&array, || {
            assert_eq!(log.commit_value_safe(0), (0, true));
        });
    }

    #[test]
    fn skip_if_done_runs_once() {
        let log = Log::new();
        let array = LogArray::boxed();
        let mut calls = 0;
        log.do_with(&array, || {
            log.skip_if_done(|| calls += 1);
        });
        log.do_with(&array, || {
            log.skip_if_done(|| calls += 1);
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn commits_spanning_multiple_blocks() {
        let log = Log::new();
        let array = LogArray::boxed();
        log.do_with(&array, || {
            for i in 1..=(LOG_LENGTH as u64 * 2 + 3) {
                assert_eq!(log.commit_value(i), (i, true));
            }
        });
    }
}
