//! Session identity, interruption, and the per-session latch stack.
//!
//! The latch itself only needs two things from the surrounding system: the
//! caller's session id and whether that session has been interrupted. Both
//! come through the [`Session`] trait.
//!
//! A [`LatchStack`] records every latch a session requests, in order, before
//! the acquisition is attempted. If the session dies, the stack still holds
//! its last intent and a cleanup daemon can hand it to
//! [`LatchStack::recover`] to unwind whatever was left behind.

use std::ptr;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::LatchConfig;
use crate::error::Result;
use crate::latch::Latch;
use crate::recovery::{RecoveryReport, ReleaseAction, RequestedMode};
use crate::sync::{AtomicBool, Ordering};
use crate::word::{SessionId, MAX_SESSION_ID};

/// The caller-side capability consumed by the interruptible latch variants.
pub trait Session {
	/// A stable identifier for the session, at most [`MAX_SESSION_ID`].
	fn id(&self) -> SessionId;

	/// Whether the session has been asked to stop waiting.
	fn is_interrupted(&self) -> bool;
}

/// A bare id is a session that is never interrupted.
impl Session for SessionId {
	fn id(&self) -> SessionId {
		*self
	}

	fn is_interrupted(&self) -> bool {
		false
	}
}

/// An in-process session with an interruption flag another thread can set.
#[derive(Debug)]
pub struct LocalSession {
	id: SessionId,
	interrupted: AtomicBool,
}

impl LocalSession {
	pub fn new(id: SessionId) -> Self {
		assert!(id <= MAX_SESSION_ID, "session id {id} does not fit the latch word");
		LocalSession {
			id,
			interrupted: AtomicBool::new(false),
		}
	}

	/// Makes every interruptible wait of this session give up.
	pub fn interrupt(&self) {
		self.interrupted.store(true, Ordering::Release);
	}

	pub fn clear_interrupt(&self) {
		self.interrupted.store(false, Ordering::Release);
	}
}

impl Session for LocalSession {
	fn id(&self) -> SessionId {
		self.id
	}

	fn is_interrupted(&self) -> bool {
		self.interrupted.load(Ordering::Acquire)
	}
}

/// One entry of a [`LatchStack`].
#[derive(Debug, Clone, Copy)]
pub struct LatchRequest<'a> {
	pub latch: &'a Latch,
	pub mode: RequestedMode,
}

/// Most sessions hold a handful of latches at a time.
const INLINE_REQUESTS: usize = 8;

/// The ordered record of latches a session has requested and not yet released.
///
/// Entries are pushed before the acquisition starts and popped after the
/// release completes, so the top of the stack reflects the session's last
/// intent even when it dies halfway through an acquisition.
pub struct LatchStack<'a> {
	session: SessionId,
	requests: Mutex<SmallVec<[LatchRequest<'a>; INLINE_REQUESTS]>>,
}

impl<'a> LatchStack<'a> {
	pub fn new(session: SessionId) -> Self {
		LatchStack {
			session,
			requests: Mutex::new(SmallVec::new()),
		}
	}

	pub fn session(&self) -> SessionId {
		self.session
	}

	pub fn len(&self) -> usize {
		self.requests.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.requests.lock().is_empty()
	}

	/// The most recent request, if any.
	pub fn top(&self) -> Option<LatchRequest<'a>> {
		self.requests.lock().last().copied()
	}

	/// Records the intent to acquire `latch` in `mode`.
	pub fn push(&self, latch: &'a Latch, mode: RequestedMode) {
		self.requests.lock().push(LatchRequest {
			latch,
			mode,
		});
	}

	/// Removes the most recent request for `latch` and returns its mode.
	pub fn pop(&self, latch: &Latch) -> Option<RequestedMode> {
		let mut requests = self.requests.lock();
		let index = requests.iter().rposition(|request| ptr::eq(request.latch, latch))?;
		Some(requests.remove(index).mode)
	}

	/// Records the request, then acquires `latch` in shared mode.
	pub fn lock_shared(&self, config: &LatchConfig, latch: &'a Latch) -> Result<()> {
		self.push(latch, RequestedMode::Shared);
		let result = latch.lock_shared(config, self.session);
		if result.is_err() {
			self.pop(latch);
		}
		result
	}

	/// Records the request, then acquires `latch` exclusively.
	pub fn lock_exclusive(&self, config: &LatchConfig, latch: &'a Latch) -> Result<()> {
		self.push(latch, RequestedMode::Exclusive);
		let result = latch.lock_exclusive(config, self.session);
		if result.is_err() {
			self.pop(latch);
		}
		result
	}

	/// Releases `latch` and forgets the matching request.
	///
	/// The request is kept if the release fails, so a later cleanup still
	/// sees it.
	pub fn unlock(&self, latch: &'a Latch) -> Result<()> {
		latch.unlock(self.session)?;
		self.pop(latch);
		Ok(())
	}

	/// Unwinds every recorded request of a dead session, most recent first.
	///
	/// Each latch gets its cleanup gate raised for the duration of its
	/// reconciliation. Violations are logged and collected; they do not stop
	/// the walk. The stack is empty afterwards.
	pub fn recover(&self) -> RecoveryReport {
		let requests = std::mem::take(&mut *self.requests.lock());
		let mut report = RecoveryReport::default();

		for request in requests.iter().rev() {
			let cleanup = request.latch.begin_cleanup();
			match cleanup.reconcile(request.mode, self.session) {
				Ok(ReleaseAction::Nothing) => report.untouched += 1,
				Ok(_) => report.released += 1,
				Err(err) => {
					warn!(session = self.session, mode = ?request.mode, %err, "latch could not be reconciled");
					report.violations.push(err);
				}
			}
		}

		debug!(
			session = self.session,
			released = report.released,
			untouched = report.untouched,
			violations = report.violations.len(),
			"session latches recovered"
		);
		report
	}
}

#[cfg(all(test, not(loom)))]
mod tests {
	use super::*;
	use crate::word::LatchWord;

	const CONFIG: LatchConfig = LatchConfig::DEFAULT;

	#[test]
	fn bare_id_is_never_interrupted() {
		let session: SessionId = 12;
		assert_eq!(session.id(), 12);
		assert!(!session.is_interrupted());
	}

	#[test]
	fn local_session_interrupt_flag() {
		let session = LocalSession::new(3);
		assert!(!session.is_interrupted());
		session.interrupt();
		assert!(session.is_interrupted());
		session.clear_interrupt();
		assert!(!session.is_interrupted());
	}

	#[test]
	#[should_panic(expected = "does not fit")]
	fn oversized_session_id_is_rejected() {
		let _ = LocalSession::new(MAX_SESSION_ID + 1);
	}

	#[test]
	fn pop_removes_the_most_recent_matching_request() {
		let a = Latch::new();
		let b = Latch::new();
		let stack = LatchStack::new(1);

		stack.push(&a, RequestedMode::Shared);
		stack.push(&b, RequestedMode::Exclusive);
		stack.push(&a, RequestedMode::Exclusive);

		assert_eq!(stack.pop(&a), Some(RequestedMode::Exclusive));
		assert_eq!(stack.len(), 2);
		assert!(ptr::eq(stack.top().unwrap().latch, &b));
		assert_eq!(stack.pop(&a), Some(RequestedMode::Shared));
		assert_eq!(stack.pop(&a), None);
	}

	#[test]
	fn tracked_lock_and_unlock_keep_the_stack_balanced() {
		let a = Latch::new();
		let b = Latch::new();
		let stack = LatchStack::new(4);

		stack.lock_shared(&CONFIG, &a).unwrap();
		stack.lock_exclusive(&CONFIG, &b).unwrap();
		assert_eq!(stack.len(), 2);

		stack.unlock(&b).unwrap();
		stack.unlock(&a).unwrap();
		assert!(stack.is_empty());
		assert!(a.is_unlocked() && b.is_unlocked());
	}

	#[test]
	fn failed_acquisition_pops_its_request() {
		let latch = Latch::new();
		latch.set_cleanup_in_progress(true);
		let stack = LatchStack::new(4);

		assert!(stack.lock_shared(&CONFIG, &latch).is_err());
		assert!(stack.is_empty());
	}

	#[test]
	fn recover_unwinds_held_latches() {
		let a = Latch::new();
		let b = Latch::new();
		let stack = LatchStack::new(6);

		stack.lock_shared(&CONFIG, &a).unwrap();
		a.lock_shared(&CONFIG, 2).unwrap();
		stack.lock_exclusive(&CONFIG, &b).unwrap();

		let report = stack.recover();
		assert_eq!(report.released, 2);
		assert_eq!(report.untouched, 0);
		assert!(report.is_clean());
		assert!(stack.is_empty());

		assert_eq!(a.word(), LatchWord::shared(1));
		assert!(b.is_unlocked());
		assert!(!a.is_cleanup_in_progress() && !b.is_cleanup_in_progress());
	}
}
