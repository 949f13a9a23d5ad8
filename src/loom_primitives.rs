//! Atomic type routing for model-checked builds.
//!
//! Built with `--cfg loom`, every location this module names is backed by
//! `loom`'s instrumented atomics instead of `std`'s, so `loom::model` can
//! explore their interleavings exhaustively at small scale. Ordinary builds
//! (including ordinary `cargo test`) see plain `std` atomics with zero
//! overhead. Only [`crate::tag`] — the one location every CAS in this crate
//! ultimately routes through — is wired to this shim; the rest of the crate
//! is exercised instead by the real-thread stress tests alongside each
//! module's other tests.

#[cfg(loom)]
pub use loom::sync::atomic::AtomicU64;
#[cfg(not(loom))]
pub use std::sync::atomic::AtomicU64;
