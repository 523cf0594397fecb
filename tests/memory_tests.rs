//! Allocation tests for the SX latch.
//!
//! A latch may live in memory shared between processes, so none of its
//! operations may touch the heap. These tests install a counting global
//! allocator and assert that latch operations perform no allocation.
//!
//! # Running Memory Tests
//!
//! ```bash
//! cargo test -p sxlatch --test memory_tests
//! ```
//!
//! # Test Design
//!
//! Counts are kept per thread so tests running in parallel do not see each
//! other's allocations. Each test runs its operations once to warm up lazily
//! initialised state (such as tracing callsites), then counts a second run.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::mem;
use sxlatch::{Error, Latch, LatchConfig, LatchStack, LatchWord, LocalSession, RequestedMode};

// ===========================================================================
// Counting Allocator
// ===========================================================================

struct CountingAllocator;

thread_local! {
	static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for CountingAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
		System.alloc(layout)
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		System.dealloc(ptr, layout)
	}

	unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
		let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
		System.realloc(ptr, layout, new_size)
	}
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Number of allocations `f` performs on the current thread, after one
/// untracked warm-up call.
fn allocations_in(mut f: impl FnMut()) -> usize {
	f();
	let before = ALLOCATIONS.with(Cell::get);
	f();
	ALLOCATIONS.with(Cell::get) - before
}

const CONFIG: LatchConfig = LatchConfig::DEFAULT;

// ===========================================================================
// Latch Operations
// ===========================================================================

#[test]
fn latch_is_plain_data() {
	assert_eq!(mem::size_of::<Latch>(), 16);
	assert_eq!(mem::align_of::<Latch>(), 8);
	assert!(!mem::needs_drop::<Latch>());
}

#[test]
fn shared_and_exclusive_cycles_do_not_allocate() {
	let latch = Latch::new();

	let count = allocations_in(|| {
		for session in 1..=4 {
			latch.lock_shared(&CONFIG, session).unwrap();
		}
		latch.try_advance_exclusive(9).unwrap();
		for session in 1..=4 {
			latch.unlock(session).unwrap();
		}
		latch.lock_exclusive(&CONFIG, 9).unwrap();
		latch.unlock(9).unwrap();

		latch.lock_mutex(&CONFIG, 3).unwrap();
		latch.unlock(3).unwrap();
		latch.lock_exclusive_no_session(&CONFIG).unwrap();
		latch.unlock_no_session();
	});

	assert_eq!(count, 0);
	assert!(latch.is_unlocked());
}

#[test]
fn guards_and_interruptible_paths_do_not_allocate() {
	let latch = Latch::new();
	let session = LocalSession::new(5);

	let count = allocations_in(|| {
		drop(latch.shared(&CONFIG, 5).unwrap());
		drop(latch.exclusive(&CONFIG, 5).unwrap());
		latch.lock_shared_interruptible(&CONFIG, &session).unwrap();
		latch.unlock(5).unwrap();
		latch.lock_exclusive_interruptible(&CONFIG, &session).unwrap();
		latch.unlock(5).unwrap();
	});

	assert_eq!(count, 0);
}

#[test]
fn failures_do_not_allocate() {
	let latch = Latch::new();
	latch.lock_exclusive(&CONFIG, 9).unwrap();

	let count = allocations_in(|| {
		assert_eq!(latch.try_lock_shared(1), Err(Error::LockBusy));
		assert!(latch.lock_exclusive(&CONFIG, 9).is_err());
		assert!(latch.unlock(1).is_err());

		latch.set_cleanup_in_progress(true);
		assert!(latch.lock_shared(&CONFIG, 1).is_err());
		latch.set_cleanup_in_progress(false);
	});

	assert_eq!(count, 0);
	assert_eq!(latch.word(), LatchWord::exclusive_acquired(9));
}

#[test]
fn reconciliation_does_not_allocate() {
	let latch = Latch::new();

	let count = allocations_in(|| {
		latch.lock_exclusive(&CONFIG, 9).unwrap();
		let cleanup = latch.begin_cleanup();
		cleanup.reconcile(RequestedMode::Exclusive, 9).unwrap();
		drop(cleanup);
	});

	assert_eq!(count, 0);
	assert!(latch.is_unlocked());
}

/// Up to eight outstanding requests live inline in the stack.
#[test]
fn shallow_latch_stacks_stay_inline() {
	let latches: Vec<Latch> = (0..8).map(|_| Latch::new()).collect();
	let stack = LatchStack::new(4);

	let count = allocations_in(|| {
		for latch in &latches {
			stack.lock_shared(&CONFIG, latch).unwrap();
		}
		for latch in latches.iter().rev() {
			stack.unlock(latch).unwrap();
		}
	});

	assert_eq!(count, 0);
	assert!(stack.is_empty());
}
