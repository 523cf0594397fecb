//! Synchronization primitives with loom support.
//!
//! Under normal compilation, re-exports from std. Under `cfg(loom)`, uses
//! loom's equivalents so the latch transitions can be model checked.
//!
//! # Usage
//!
//! Instead of importing directly from `std::sync::atomic` or `std::thread`,
//! import from this module:
//!
//! ```ignore
//! use crate::sync::{AtomicU64, Ordering};
//! use crate::sync::thread;
//! ```
//!
//! # Loom Integration
//!
//! When compiled with `--cfg loom`, every atomic access, yield and sleep in the
//! latch goes through loom, which explores the possible interleavings of the
//! threads in a `loom::model` closure.

// Some items are only used under one of the two cfgs
#![allow(unused)]

// ===========================================================================
// Atomic Primitives
// ===========================================================================

#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

// ===========================================================================
// Thread Scheduling
// ===========================================================================

/// Voluntary scheduling points used by the backoff loops.
pub mod thread {
	use std::time::Duration;

	#[cfg(not(loom))]
	pub use std::thread::{sleep, yield_now};

	#[cfg(loom)]
	pub use loom::thread::yield_now;

	/// Loom has no notion of wall-clock time, so a sleep is modelled as a yield.
	#[cfg(loom)]
	pub fn sleep(_duration: Duration) {
		loom::thread::yield_now();
	}
}
