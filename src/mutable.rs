//! Replayable atomic cells.
//!
//! [`Mutable<T>`] and [`WriteOnce<T>`] are the two atomic cell types every
//! structure node in this crate is built from. Both store a pointer-sized
//! payload; both route reads through the caller's [`Log`] so that "the
//! first reader through a given log wins" — every later read at that log
//! position (whether from a racing helper replaying the same thunk, or a
//! second read later in the same thunk) observes the same value, even if
//! the underlying atomic has since changed.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::announce::WriteAnnouncements;
use crate::log::Log;
use crate::tag::Tag;

/// A counter-tagged atomic pointer cell, mutated via [`Tag::cas`].
pub struct Mutable<T> {
    raw: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// The payload is a plain pointer-sized word manipulated only through
// atomics; ordinary pointer `Send`/`Sync` restrictions don't apply here.
unsafe impl<T> Send for Mutable<T> {}
unsafe impl<T> Sync for Mutable<T> {}

impl<T> Mutable<T> {
    /// Construct a cell holding `value` with a fresh tag.
    pub fn new(value: *mut T) -> Self {
        Mutable {
            raw: AtomicU64::new(Tag::init(value as u64)),
            _marker: PhantomData,
        }
    }

    /// Read the current value, replayed through `log`: the first read at the
    /// log's current position wins and is what every later read through the
    /// same log (this thread or a helper replaying the same thunk) observes.
    pub fn load(&self, log: &Log) -> *mut T {
        let raw = self.raw.load(Ordering::Acquire);
        let (committed, _first) = log.commit_value(raw);
        Tag::value(committed) as *mut T
    }

    /// Raw, unlogged snapshot — used by non-hot-path introspection (e.g.
    /// tests, node-type histograms) where replay semantics don't apply.
    pub fn load_unlogged(&self) -> *mut T {
        Tag::value(self.raw.load(Ordering::Acquire)) as *mut T
    }

    /// Attempt to store `new_value`, CAS'ing against whatever this log has
    /// already (idempotently) observed as the current value. Returns
    /// whether the swap succeeded.
    pub fn store(
        &self,
        new_value: *mut T,
        worker: usize,
        announcements: &WriteAnnouncements,
        log: &Log,
    ) -> bool {
        let observed_raw = self.raw.load(Ordering::Acquire);
        let (old_raw, _first) = log.commit_value(observed_raw);
        Tag::cas(
            &self.raw,
            old_raw,
            new_value as u64,
            worker,
            announcements,
            Some(log),
            false,
        )
        .is_ok()
    }

    /// Store unconditionally, bypassing the log and tag machinery —
    /// intended only for initializing a node's fields before it is ever
    /// published to other threads.
    pub fn init_store(&self, value: *mut T) {
        self.raw.store(Tag::init(value as u64), Ordering::Release);
    }
}

/// An atomic cell expected to be written at most once per logical lifetime.
/// Reads replay through the caller's log via `commit_value_safe`, which
/// (unlike [`Mutable::load`]) tolerates a logically stored zero/null.
pub struct WriteOnce<T> {
    raw: AtomicU64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for WriteOnce<T> {}
unsafe impl<T> Sync for WriteOnce<T> {}

impl<T> WriteOnce<T> {
    /// Construct a cell pre-populated with `value` (often null, to be
    /// written once later via [`WriteOnce::set`]).
    pub fn new(value: *mut T) -> Self {
        WriteOnce {
            raw: AtomicU64::new(value as u64),
            _marker: PhantomData,
        }
    }

    /// Read the value, replayed through `log`.
    pub fn load(&self, log: &Log) -> *mut T {
        let raw = self.raw.load(Ordering::Acquire);
        let (committed, _first) = log.commit_value_safe(raw);
        committed as *mut T
    }

    /// Perform the single physical write. Callers are responsible for
    /// ensuring this happens at most once before the cell is published.
    pub fn set(&self, value: *mut T) {
        self.raw.store(value as u64, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerInfo;

    fn announcements() -> WriteAnnouncements {
        WriteAnnouncements::new(&WorkerInfo::new(vec![std::thread::current().id()]))
    }

    #[test]
    fn load_without_log_activity_passes_through() {
        let mut x = 10;
        let cell = Mutable::new(&mut x as *mut i32);
        let log = Log::new();
        assert_eq!(cell.load(&log), &mut x as *mut i32);
    }

    #[test]
    fn store_then_load_observes_new_value() {
        let mut a = 1;
        let mut b = 2;
        let cell = Mutable::new(&mut a as *mut i32);
        let ann = announcements();
        let log = Log::new();
        let array = crate::log::LogArray::new();
        log.do_with(&array, || {
            assert!(cell.store(&mut b as *mut i32, 0, &ann, &log));
        });
        assert_eq!(cell.load_unlogged(), &mut b as *mut i32);
    }

    #[test]
    fn second_load_through_same_log_position_is_stable() {
        let mut a = 1;
        let mut b = 2;
        let cell = Mutable::new(&mut a as *mut i32);
        let log = Log::new();
        let array = crate::log::LogArray::new();
        log.do_with(&array, || {
            let first = cell.load(&log);
            cell.init_store(&mut b as *mut i32);
            let second = cell.load(&log);
            assert_eq!(first, second, "replayed read must not observe the concurrent change");
        });
    }

    #[test]
    fn write_once_permits_null() {
        let cell: WriteOnce<i32> = WriteOnce::new(std::ptr::null_mut());
        let log = Log::new();
        assert!(cell.load(&log).is_null());
    }
}
