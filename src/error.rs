//! # Error Types for the SX Latch
//!
//! Every acquisition and release reports its outcome synchronously through
//! [`Result`]. Transient contention never shows up here: the blocking
//! variants retry until they succeed, so an error always means the caller
//! has to make a decision.
//!
//! ## Error Kinds
//!
//! ```text
//!  acquire ──► gate raised? ──yes──► Err(LockTimeout(CleanupInProgress))
//!      │
//!      ▼ no
//!  spin / CAS ──► interrupted? ──yes──► Err(LockInterrupted)
//!      │         deadline?    ──yes──► Err(LockTimeout(Deadline))
//!      │         try variant  ──────► Err(LockBusy)
//!      ▼
//!    Ok(())
//! ```
//!
//! [`Error::ProtocolViolation`] is different in kind: it signals a caller bug
//! or a corrupted latch word, never contention. It is logged at `error`
//! level where it is detected and the latch word is left untouched.

use thiserror::Error;

use crate::recovery::RequestedMode;
use crate::word::{LatchWord, SessionId};

/// Errors returned by latch operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// The acquisition gave up without observing contention resolve.
	///
	/// Raised immediately when a cleanup is in progress on the latch, or by
	/// the interruptible variants once the configured deadline elapses.
	#[error("latch acquisition timed out ({0})")]
	LockTimeout(TimeoutCause),

	/// The caller's session was interrupted while waiting.
	#[error("latch acquisition interrupted for session {session}")]
	LockInterrupted {
		session: SessionId,
	},

	/// A try variant found the latch unavailable.
	#[error("latch is busy")]
	LockBusy,

	/// The session tried to acquire an exclusive latch it already owns.
	///
	/// The latch is not reentrant; spinning would never terminate.
	#[error("session {session} already holds this latch exclusively")]
	SelfDeadlock {
		session: SessionId,
	},

	/// The latch protocol was broken. Expected never to happen with correct
	/// callers.
	#[error("latch protocol violation: {0}")]
	ProtocolViolation(Violation),
}

/// Why an acquisition timed out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
	#[error("cleanup in progress")]
	CleanupInProgress,
	#[error("deadline elapsed")]
	Deadline,
}

/// The specific protocol violation behind [`Error::ProtocolViolation`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
	/// An exclusive latch was released by a session that does not own it.
	#[error("session {session} released a latch exclusively held by session {owner}")]
	ReleaseByNonOwner {
		session: SessionId,
		owner: SessionId,
	},

	/// Recovery was asked to unwind a state the requested mode cannot produce.
	#[error("cannot reconcile a {requested:?} request against {word:?}")]
	ImpossibleRecoveryState {
		requested: RequestedMode,
		word: LatchWord,
	},

	/// A recorded requested mode did not decode.
	#[error("invalid requested latch mode {0}")]
	InvalidRequestedMode(u8),

	/// The latch word carries an undefined mode.
	#[error("corrupt latch word {0:#018x}")]
	CorruptWord(u64),

	/// The session id does not fit the owner field of the latch word.
	#[error("session id {0} exceeds the latch word's 28-bit owner field")]
	SessionOutOfRange(SessionId),

	/// Recovery ran without the cleanup gate raised.
	#[error("reconciliation attempted without the cleanup gate raised")]
	GateNotRaised,
}

impl Error {
	/// Returns true for errors that indicate a caller bug rather than contention.
	pub fn is_protocol_violation(&self) -> bool {
		matches!(self, Error::ProtocolViolation(_) | Error::SelfDeadlock { .. })
	}
}

impl From<Violation> for Error {
	fn from(violation: Violation) -> Self {
		Error::ProtocolViolation(violation)
	}
}

/// A Result type alias using the latch [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
