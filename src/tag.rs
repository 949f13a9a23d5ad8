//! Counter-tagged atomics.
//!
//! Every CAS-able location in this crate stores a 64-bit word: the payload
//! in the low 48 bits, a 16-bit tag in the high bits (15 counter bits plus
//! one "panic" bit). [`Tag::cas`] picks a counter value for its CAS attempt
//! that no concurrently-announced writer (see [`crate::announce`]) is also
//! choosing, which defeats ABA without bounding the number of concurrent
//! writers to a fixed constant — contended locations merely pay an
//! escalating ("panicking") scan cost.

use std::cell::Cell;
use std::sync::atomic::Ordering;

use crate::announce::{self, WriteAnnouncements};
use crate::loom_primitives::AtomicU64;
use crate::log::Log;

/// Width of the tag field.
pub const TAG_BITS: u32 = 16;
/// Width of the payload field.
pub const DATA_BITS: u32 = 64 - TAG_BITS;
/// Mask selecting the payload bits of a raw word.
pub const DATA_MASK: u64 = (1u64 << DATA_BITS) - 1;
/// Mask selecting the tag bits of a raw word.
pub const TAG_MASK: u64 = !DATA_MASK;
/// Within the 16-bit tag field, the bit marking "panicking" (escalated ABA
/// defense is active for this location).
const PANIC_FLAG: u64 = 1 << (TAG_BITS - 1);
/// Within the 16-bit tag field, the counter proper (15 bits).
const COUNTER_MASK: u64 = PANIC_FLAG - 1;

/// Namespace for counter-tag encode/decode/CAS operations.
pub struct Tag;

impl Tag {
    /// Encode a payload with an initial counter of 1, unset panic bit.
    #[inline]
    pub const fn init(v: u64) -> u64 {
        Self::encode(1, v)
    }

    /// Pack a 16-bit tag and payload into one raw word.
    #[inline]
    pub const fn encode(tag: u64, value: u64) -> u64 {
        ((tag & 0xFFFF) << DATA_BITS) | (value & DATA_MASK)
    }

    /// Extract the payload from a raw word.
    #[inline]
    pub const fn value(raw: u64) -> u64 {
        raw & DATA_MASK
    }

    /// Extract the full 16-bit tag field (counter + panic bit) from a raw word.
    #[inline]
    pub const fn tag(raw: u64) -> u64 {
        (raw & TAG_MASK) >> DATA_BITS
    }

    /// Whether a raw word's location has escalated into panic mode.
    #[inline]
    pub const fn is_panicking(raw: u64) -> bool {
        Self::tag(raw) & PANIC_FLAG != 0
    }

    fn next_tag(old_raw: u64, addr_bits: u64, announcements: &WriteAnnouncements) -> u64 {
        let old_tag = Self::tag(old_raw);
        let old_counter = old_tag & COUNTER_MASK;
        let was_panicking = old_tag & PANIC_FLAG != 0;
        let mut next_counter = (old_counter + 1) & COUNTER_MASK;
        let overflowed = next_counter == 0 && old_counter != 0;
        let mut panicking = was_panicking || overflowed;

        if panicking {
            loop {
                let collides = announcements.scan().into_iter().any(|t| {
                    t != announce::EMPTY
                        && Self::value(t) == (addr_bits & DATA_MASK)
                        && (Self::tag(t) & COUNTER_MASK) == next_counter
                });
                if !collides {
                    break;
                }
                next_counter = (next_counter + 1) & COUNTER_MASK;
            }
            panicking = true;
        }

        if panicking {
            next_counter | PANIC_FLAG
        } else {
            next_counter
        }
    }

    /// Attempt a tagged compare-and-swap.
    ///
    /// `old_raw` is the previously observed full raw word (payload + tag).
    /// `new_value` is the new payload to publish; its tag is chosen by this
    /// call. When `aba_free` is `false` and a descriptor's log is active,
    /// the attempt is published via `announcements` before racing, and
    /// retried (not re-executed, if already claimed by a helper) under the
    /// log's idempotent `skip_if_done` gate.
    ///
    /// Returns `Ok(new_raw)` on a successful swap (by this thread or, if
    /// skipped because a helper already ran it, the current observed raw
    /// word), or `Err(current_raw)` on failure.
    pub fn cas(
        loc: &AtomicU64,
        old_raw: u64,
        new_value: u64,
        worker: usize,
        announcements: &WriteAnnouncements,
        log: Option<&Log>,
        aba_free: bool,
    ) -> Result<u64, u64> {
        let addr_bits = loc as *const AtomicU64 as u64;
        let log_active = log.map_or(false, |l| !l.is_empty());
        let announce_this = log_active && !aba_free;

        if announce_this {
            announcements.set(worker, Self::encode(Self::tag(old_raw), addr_bits));
        }

        let outcome: Cell<Option<Result<u64, u64>>> = Cell::new(None);
        let run = || {
            let tag = Self::next_tag(old_raw, addr_bits, announcements);
            let new_raw = Self::encode(tag, new_value);
            let r = loc.compare_exchange(old_raw, new_raw, Ordering::AcqRel, Ordering::Acquire);
            outcome.set(Some(r));
        };

        match log {
            Some(l) if !l.is_empty() => l.skip_if_done(run),
            _ => run(),
        }

        if announce_this {
            announcements.clear(worker);
        }

        outcome
            .into_inner()
            .unwrap_or_else(|| Ok(loc.load(Ordering::Acquire)))
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
    fn encode_decode_roundtrip() {
        let raw = Tag::encode(3, 0xDEAD);
        assert_eq!(Tag::value(raw), 0xDEAD);
        assert_eq!(Tag::tag(raw), 3);
    }

    #[test]
    fn init_starts_at_counter_one() {
        let raw = Tag::init(42);
        assert_eq!(Tag::value(raw), 42);
        assert_eq!(Tag::tag(raw), 1);
        assert!(!Tag::is_panicking(raw));
    }

    #[test]
    fn cas_without_log_increments_counter() {
        let loc = AtomicU64::new(Tag::init(1));
        let ann = announcements();
        let old = loc.load(Ordering::Acquire);
        let r = Tag::cas(&loc, old, 2, 0, &ann, None, true).unwrap();
        assert_eq!(Tag::value(r), 2);
        assert_eq!(Tag::tag(r), 2);
    }

    #[test]
    fn cas_fails_on_stale_old_raw() {
        let loc = AtomicU64::new(Tag::init(1));
        let ann = announcements();
        let stale = Tag::init(1) ^ 0xFF; // doesn't match current raw
        let r = Tag::cas(&loc, stale, 2, 0, &ann, None, true);
        assert!(r.is_err());
    }

    #[test]
    fn cas_through_active_log_is_idempotent() {
        use crate::log::{Log, LogArray};
        let loc = AtomicU64::new(Tag::init(1));
        let ann = announcements();
        let log = Log::new();
        let array = LogArray::new();
        log.do_with(&array, || {
            let old = loc.load(Ordering::Acquire);
            let r1 = Tag::cas(&loc, old, 2, 0, &ann, Some(&log), false);
            assert!(r1.is_ok());
        });
        // Re-run the "same thunk" through the same log position: should be
        // skipped (idempotent), not double-applied.
        log.do_with(&array, || {
            let old = Tag::init(1);
            let r2 = Tag::cas(&loc, old, 99, 0, &ann, Some(&log), false);
            assert!(r2.is_ok());
        });
        assert_eq!(Tag::value(loc.load(Ordering::Acquire)), 2);
    }
}

/// Model-checked interleavings of [`Tag::cas`], run only with `--cfg loom`
/// (`RUSTFLAGS="--cfg loom" cargo test --release --test loom -- --ignored`
/// style invocations; see the crate's `README.md`).
#[cfg(loom)]
mod loom_tests {
    use super::*;
    use crate::worker::WorkerInfo;
    use loom::sync::Arc;

    fn announcements() -> WriteAnnouncements {
        WriteAnnouncements::new(&WorkerInfo::new(vec![std::thread::current().id()]))
    }

    /// Two threads racing a tagged CAS on the same word never both observe
    /// success against the same `old_raw`, and the tag always advances
    /// (defeating ABA) no matter which thread wins.
    #[test]
    fn concurrent_cas_never_double_succeeds() {
        loom::model(|| {
            let loc = Arc::new(AtomicU64::new(Tag::init(1)));
            let ann = Arc::new(announcements());

            let threads: Vec<_> = (0..2)
                .map(|i| {
                    let loc = loc.clone();
                    let ann = ann.clone();
                    loom::thread::spawn(move || Tag::cas(&loc, Tag::init(1), 2 + i, i as usize, &ann, None, true))
                })
                .collect();

            let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
            let successes = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(successes, 1, "exactly one racer should win the CAS");
        });
    }
}
