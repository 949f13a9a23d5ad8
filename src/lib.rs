//! # flock-structures
//!
//! Lock-free locks, a scalable bounded queue, and concurrent ordered maps
//! built on epoch-based memory reclamation.
//!
//! The foundation is a *helping* [`Lock`](lock::Lock): a critical section is
//! posted as a [`Descriptor`](lock::Descriptor) (a thunk plus the replayable
//! [`Log`](log::Log) it commits through), and any thread that finds the lock
//! held runs that same descriptor itself instead of blocking. Every write the
//! thunk performs is idempotent under replay, so the owner and any number of
//! helpers produce exactly one observable effect. [`pool::MemoryPool`] layers
//! epoch-based reclamation on top so a node retired by one thread isn't freed
//! until every thread that might still be touching it has moved on.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`worker`] - dense worker-id registration
//! - [`cc`] - compiler compatibility utilities (bit operations, branch hints)
//! - [`pr`] - atomic primitives and memory barriers
//! - [`backoff`] - exponential backoff for contention management
//! - [`malloc`] - memory allocator abstraction
//! - [`error`] - error types surfaced across the public boundary
//!
//! ### Reclamation and Replay
//! - [`tag`] - counter-tagged atomics with ABA-defeating escalation
//! - [`announce`] - per-worker write announcements
//! - [`log`] - idempotent replay log
//! - [`epoch`] - epoch-based safe memory reclamation
//! - [`pool`] - epoch/tagged memory pools built on the epoch and log layers
//! - [`mutable`] - replayable atomic cells
//!
//! ### Locks
//! - [`lock`] - the helping lock and its plain spinning fallback
//! - [`rwlock`] - a write-biased reader-writer spinlock
//! - [`spinlock`] - fetch-and-set and ticket spinlocks
//!
//! ### Structures
//! - [`queue`] - a bounded, lock-free MPMC circular queue
//! - [`bst`] - a lock-free-lock binary search tree
//! - [`art`] - a lock-free-lock adaptive radix tree over `u64` keys
//! - [`mutex_bst`] - a baseline, [`rwlock`]-backed sorted map for comparison

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Dense worker-id registration.
pub mod worker;

/// Compiler compatibility utilities.
pub mod cc;

/// Atomic primitives and memory barriers.
pub mod pr;

/// Exponential backoff for contention management.
pub mod backoff;

/// Memory allocator abstraction.
pub mod malloc;

/// Error types surfaced across the public boundary.
pub mod error;

/// Atomic type routing for `--cfg loom` model-checked builds.
mod loom_primitives;

// =============================================================================
// Tier 1: Reclamation and Replay (Depends on Tier 0)
// =============================================================================

/// Counter-tagged atomics with ABA-defeating escalation.
pub mod tag;

/// Per-worker write announcements.
pub mod announce;

/// Idempotent replay log.
pub mod log;

/// Epoch-based safe memory reclamation.
pub mod epoch;

/// Epoch and tagged memory pools.
pub mod pool;

/// Replayable atomic cells.
pub mod mutable;

// =============================================================================
// Tier 2: Locks (Depends on Tiers 0-1)
// =============================================================================

/// The helping lock and its plain spinning fallback.
pub mod lock;

/// A write-biased reader-writer spinlock.
pub mod rwlock;

/// Fetch-and-set and ticket spinlocks.
pub mod spinlock;

// =============================================================================
// Tier 3: Structures (Depends on Tiers 0-2)
// =============================================================================

/// A bounded, lock-free multi-producer/multi-consumer circular queue.
pub mod queue;

/// A lock-free-lock binary search tree.
pub mod bst;

/// A lock-free-lock adaptive radix tree over `u64` keys.
pub mod art;

/// A baseline, reader-writer-lock-backed sorted map.
pub mod mutex_bst;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use art::LockFreeLockArt;
pub use bst::LockFreeLockBst;
pub use error::{BadAllocation, FlockError, OverflowError};
pub use malloc::{Allocator, GlobalAllocator};
pub use mutex_bst::MutexBst;
pub use queue::ScalableCircularQueue;
pub use worker::{WorkerId, WorkerInfo};
