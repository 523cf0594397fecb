//! # sxlatch: A Session-Owned SX Latch
//!
//! This crate provides a lock-free read/write latch for buffer and page
//! latching in a storage engine. Acquisitions are frequent and short, the
//! latch may live in memory shared between processes, and a session that
//! dies in the middle of an acquisition must be recoverable without a lock
//! manager.
//!
//! ## Design Overview
//!
//! **One word, three fields**: the mode, the exclusive owner and the reader
//! count are packed into a single 64-bit word (see [`word`]), so every
//! transition is one compare-and-swap and no field is ever observed
//! half-updated.
//!
//! **Three modes**:
//! - **Shared**: any number of readers. A reader count of zero is the
//!   unlocked latch.
//! - **ExclusiveBlocked**: a writer has announced itself. No new reader gets
//!   in while the existing ones drain.
//! - **ExclusiveAcquired**: a single session owns the latch.
//!
//! **Spinning, not parking**: a thread that cannot make progress yields, and
//! optionally sleeps, according to a [`LatchConfig`]. There is no wait queue
//! and no fairness.
//!
//! **Crash recovery**: each latch carries a cleanup gate. While it is raised,
//! new acquisitions fail with [`Error::LockTimeout`] and the [`recovery`]
//! module can decide, from a dead session's last recorded intent and the
//! current word, how to unwind what the session left behind.
//!
//! ```text
//!   session                        cleanup daemon
//!   ───────                        ──────────────
//!   stack.push(latch, mode)
//!   latch.lock_*(..)      ✗ dies
//!                                  latch.begin_cleanup()       gate up
//!                                  reconcile(mode, session)    unwind
//!                                  drop(guard)                 gate down
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use sxlatch::{Latch, LatchConfig, LatchWord};
//!
//! let config = LatchConfig::default();
//! let latch = Latch::new();
//!
//! // Two readers
//! latch.lock_shared(&config, 1).unwrap();
//! latch.lock_shared(&config, 2).unwrap();
//! assert_eq!(latch.word(), LatchWord::shared(2));
//! latch.unlock(1).unwrap();
//! latch.unlock(2).unwrap();
//!
//! // One writer, released through a guard
//! {
//!     let _guard = latch.exclusive(&config, 3).unwrap();
//!     assert_eq!(latch.word(), LatchWord::exclusive_acquired(3));
//! }
//! assert!(latch.is_unlocked());
//! ```
//!
//! ## Recovery
//!
//! ```
//! use sxlatch::{Latch, LatchConfig, LatchWord, RequestedMode, ReleaseAction};
//!
//! let config = LatchConfig::default();
//! let latch = Latch::new();
//! latch.lock_shared(&config, 1).unwrap();
//! latch.lock_shared(&config, 2).unwrap();
//!
//! // Session 9 blocks the readers, then dies before they drain.
//! latch.try_advance_exclusive(9).unwrap();
//! assert_eq!(latch.word(), LatchWord::exclusive_blocked(9, 2));
//!
//! let cleanup = latch.begin_cleanup();
//! assert_eq!(cleanup.reconcile(RequestedMode::Exclusive, 9), Ok(ReleaseAction::WithdrawBlock));
//! drop(cleanup);
//!
//! assert_eq!(latch.word(), LatchWord::shared(2));
//! ```

pub mod config;
pub mod error;
pub mod latch;
pub mod recovery;
pub mod session;
pub mod word;

mod backoff;
mod sync;

pub use config::LatchConfig;
pub use error::{Error, Result, TimeoutCause, Violation};
pub use latch::{ExclusiveGuard, ExclusiveProgress, Latch, SharedGuard};
pub use recovery::{plan, CleanupGuard, RecoveryReport, ReleaseAction, RequestedMode};
pub use session::{LatchRequest, LatchStack, LocalSession, Session};
pub use word::{LatchState, LatchWord, Mode, SessionId, MAX_SESSION_ID, NO_SESSION};
