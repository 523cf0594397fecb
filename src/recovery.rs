//! Crash recovery for latches left behind by a dead session.
//!
//! A session records the mode it requests *before* it touches a latch (see
//! [`crate::session::LatchStack`]). When the session dies, that record says
//! what it was trying to do but not whether the transition happened. The
//! reconciler resolves this by looking at the current word:
//!
//! ```text
//!                       current mode of the latch
//!             |-----------|----------------|-------------------|---------|
//!             |  Shared   | ExclAcquired   | ExclBlocked       | invalid |
//!  |----------|-----------|----------------|-------------------|---------|
//!  | Shared   | count - 1 | nothing        | count - 1         | error   |
//!  | Excl     | error     | owner: unlock  | owner: to Shared  | error   |
//!  |----------|-----------|----------------|-------------------|---------|
//! ```
//!
//! A shared request is always safe to give back once: either the session had
//! incremented the count, or the count is decremented on behalf of another
//! reader's cleanup that will find it already released (the count is clamped
//! at zero and only gates exclusive transitions). An exclusive request only
//! ever touches the word if the recorded owner is the dead session.
//!
//! Reconciliation must run with the cleanup gate raised so no live session
//! can start a new acquisition against a half-unwound latch. Use
//! [`Latch::begin_cleanup`] to get a [`CleanupGuard`] that raises and lowers
//! the gate.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{Error, Result, Violation};
use crate::latch::{check_session, Latch};
use crate::word::{LatchState, LatchWord, SessionId};

/// The mode a session recorded before acquiring a latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedMode {
	Shared,
	Exclusive,
}

impl TryFrom<u8> for RequestedMode {
	type Error = Error;

	/// Decodes the persisted mode index: `0` is shared, `1` is exclusive.
	fn try_from(value: u8) -> Result<Self> {
		match value {
			0 => Ok(RequestedMode::Shared),
			1 => Ok(RequestedMode::Exclusive),
			other => Err(Violation::InvalidRequestedMode(other).into()),
		}
	}
}

impl From<RequestedMode> for u8 {
	fn from(mode: RequestedMode) -> u8 {
		match mode {
			RequestedMode::Shared => 0,
			RequestedMode::Exclusive => 1,
		}
	}
}

/// What recovery does to a latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
	/// Give back one reader.
	ReleaseShared,
	/// Unlock a latch the dead session held exclusively.
	ReleaseExclusive,
	/// Turn the dead session's `ExclusiveBlocked` back into `Shared`,
	/// keeping the remaining readers.
	WithdrawBlock,
	/// The dead session never got this latch, or someone else holds it now.
	Nothing,
	/// The combination cannot arise from a correct session.
	Impossible,
}

/// Decides how to unwind a latch for a dead `session` that had requested
/// `requested`, given the latch's current `state`.
pub fn plan(requested: RequestedMode, session: SessionId, state: LatchState) -> ReleaseAction {
	use LatchState as S;
	use RequestedMode as R;

	match (requested, state) {
		(_, S::Invalid { .. }) => ReleaseAction::Impossible,

		(R::Shared, S::Shared { .. }) | (R::Shared, S::ExclusiveBlocked { .. }) => ReleaseAction::ReleaseShared,
		(R::Shared, S::ExclusiveAcquired { .. }) => ReleaseAction::Nothing,

		(R::Exclusive, S::Shared { .. }) => ReleaseAction::Impossible,
		(R::Exclusive, S::ExclusiveAcquired { owner }) if owner == session => ReleaseAction::ReleaseExclusive,
		(R::Exclusive, S::ExclusiveBlocked { owner, .. }) if owner == session => ReleaseAction::WithdrawBlock,
		(R::Exclusive, S::ExclusiveAcquired { .. }) | (R::Exclusive, S::ExclusiveBlocked { .. }) => {
			ReleaseAction::Nothing
		}
	}
}

impl ReleaseAction {
	/// The word this action turns `current` into, or `None` when the word
	/// stays as it is.
	pub fn apply(self, current: LatchWord) -> Option<LatchWord> {
		match self {
			ReleaseAction::ReleaseShared => match current.shared_count() {
				0 => None,
				count => Some(current.with_shared_count(count - 1)),
			},
			ReleaseAction::ReleaseExclusive => Some(LatchWord::UNLOCKED),
			ReleaseAction::WithdrawBlock => Some(LatchWord::shared(current.shared_count())),
			ReleaseAction::Nothing | ReleaseAction::Impossible => None,
		}
	}
}

impl Latch {
	/// Unwinds whatever a dead `session` may have left on this latch after
	/// requesting it in `requested` mode.
	///
	/// Returns the action that changed the word, or [`ReleaseAction::Nothing`]
	/// if the word was left alone. Requires the cleanup gate to be raised.
	pub fn reconcile_for_recovery(&self, requested: RequestedMode, session: SessionId) -> Result<ReleaseAction> {
		check_session(session)?;
		if !self.is_cleanup_in_progress() {
			error!(session, ?requested, "reconciliation attempted without the cleanup gate raised");
			return Err(Violation::GateNotRaised.into());
		}

		loop {
			let current = self.word();
			let action = plan(requested, session, current.state());

			if action == ReleaseAction::Impossible {
				error!(session, ?requested, word = ?current, "latch state cannot result from this request");
				return Err(Violation::ImpossibleRecoveryState {
					requested,
					word: current,
				}
				.into());
			}

			let Some(next) = action.apply(current) else {
				if action == ReleaseAction::ReleaseShared {
					warn!(session, word = ?current, "no shared holder left to release during recovery");
				}
				debug!(session, ?requested, word = ?current, "recovery left latch untouched");
				return Ok(ReleaseAction::Nothing);
			};

			// A failed CAS means the word moved under us; plan again from the new word.
			if self.cas(current, next) {
				debug!(session, ?requested, ?action, from = ?current, to = ?next, "recovery released latch");
				return Ok(action);
			}
		}
	}

	/// Raises the cleanup gate until the returned guard is dropped.
	pub fn begin_cleanup(&self) -> CleanupGuard<'_> {
		self.set_cleanup_in_progress(true);
		CleanupGuard {
			latch: self,
		}
	}
}

/// RAII structure that keeps the cleanup gate of a latch raised.
#[must_use = "the cleanup gate is lowered as soon as the guard is dropped"]
pub struct CleanupGuard<'a> {
	latch: &'a Latch,
}

impl<'a> CleanupGuard<'a> {
	/// See [`Latch::reconcile_for_recovery`].
	pub fn reconcile(&self, requested: RequestedMode, session: SessionId) -> Result<ReleaseAction> {
		self.latch.reconcile_for_recovery(requested, session)
	}

	pub fn latch(&self) -> &'a Latch {
		self.latch
	}
}

impl<'a> Drop for CleanupGuard<'a> {
	fn drop(&mut self) {
		self.latch.set_cleanup_in_progress(false);
	}
}

/// Summary of a session cleanup, see [`crate::session::LatchStack::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
	/// Latches whose word recovery changed.
	pub released: usize,
	/// Latches recovery left as they were.
	pub untouched: usize,
	/// Protocol violations met on the way. They do not stop the cleanup.
	pub violations: Vec<Error>,
}

impl RecoveryReport {
	pub fn is_clean(&self) -> bool {
		self.violations.is_empty()
	}
}
