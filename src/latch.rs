//! Implementation of the session-owned SX latch.
//!
//! The latch is a single 64-bit word (see [`crate::word`]) plus a cleanup
//! gate counter. Readers increment a shared count, a writer first announces
//! itself by moving the word to `ExclusiveBlocked`, which stops new readers,
//! and completes the acquisition once the remaining readers have drained.
//!
//! ```text
//!             lock_shared                 lock_exclusive (readers present)
//!  Unlocked ─────────────► Shared(n) ─────────────────────────► ExclusiveBlocked(s, n)
//!     ▲  │                    │  ▲                                        │
//!     │  │ lock_exclusive     │  │ unlock (n - 1)               unlock ... n == 0
//!     │  ▼                    ▼  │                                        ▼
//!     └── ExclusiveAcquired(s) ◄─────────────────────────────── ExclusiveBlocked(s, 0)
//!           unlock(s)
//! ```
//!
//! There is no wait queue. A thread that cannot make its transition backs off
//! (see [`LatchConfig`]) and tries again, so the blocking variants never
//! return on contention alone. Interruptible variants poll the caller's
//! [`Session`] and may also stop at a configured deadline. Try variants make
//! exactly one attempt.
//!
//! While the cleanup gate is raised every acquisition fails up front with
//! [`Error::LockTimeout`]; releases are unaffected. See [`crate::recovery`].
//!
//! The latch is not reentrant: an exclusive acquisition by the session that
//! already holds the latch fails with [`Error::SelfDeadlock`].

use std::fmt;
use std::mem::ManuallyDrop;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::backoff::Backoff;
use crate::config::LatchConfig;
use crate::error::{Error, Result, TimeoutCause, Violation};
use crate::session::Session;
use crate::sync::{thread, AtomicI32, AtomicU64, Ordering};
use crate::word::{LatchState, LatchWord, SessionId, MAX_SESSION_ID, NO_SESSION};

/// Outcome of [`Latch::try_advance_exclusive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveProgress {
	/// The caller now holds the latch exclusively.
	Acquired,
	/// The caller blocks new readers and waits for the current ones to drain.
	Blocked,
}

/// What a single attempt at a transition observed.
enum Attempt {
	/// The acquisition completed.
	Done,
	/// This attempt moved the word to `ExclusiveBlocked` for the caller.
	Blocked,
	/// The caller's own block is in place, readers are still draining.
	Draining,
	/// Lost a CAS race; worth retrying immediately.
	Raced,
	/// Someone else holds the latch in a conflicting mode.
	Wait,
}

/// A lock-free SX latch.
///
/// The struct is `repr(C)` and owns no heap memory, so it can be embedded in
/// page headers or other shared structures. All state changes go through
/// compare-and-swap on the word and on the gate.
#[repr(C)]
pub struct Latch {
	word: AtomicU64,
	cleanup: AtomicI32,
}

impl Latch {
	/// Creates an unlocked latch with the cleanup gate lowered.
	///
	/// Usable in `static` items and constant page-header initialisers.
	#[cfg(not(loom))]
	#[inline]
	pub const fn new() -> Latch {
		Latch {
			word: AtomicU64::new(LatchWord::UNLOCKED.into_raw()),
			cleanup: AtomicI32::new(0),
		}
	}

	/// Loom atomics cannot be built in a const context.
	#[cfg(loom)]
	pub fn new() -> Latch {
		Latch {
			word: AtomicU64::new(LatchWord::UNLOCKED.into_raw()),
			cleanup: AtomicI32::new(0),
		}
	}

	/// Resets an existing latch to unlocked with the gate lowered.
	///
	/// Only valid when no other thread uses the latch.
	pub fn init(&self) {
		self.word.store(LatchWord::UNLOCKED.into_raw(), Ordering::Release);
		self.cleanup.store(0, Ordering::Release);
	}

	/// Waits for an in-progress cleanup to leave the latch unlocked, then
	/// resets it.
	///
	/// The wait ends as soon as either the gate is lowered or the word is
	/// unlocked, and never lasts longer than `config.destroy_timeout`. The
	/// latch is reset regardless of what it observed.
	pub fn destroy(&self, config: &LatchConfig) {
		let start = Instant::now();
		while self.is_cleanup_in_progress() && !self.is_unlocked() {
			if start.elapsed() >= config.destroy_timeout {
				warn!(word = ?self.word(), depth = self.cleanup_depth(), "destroying a latch while cleanup is still running");
				break;
			}
			thread::sleep(config.destroy_poll_interval);
		}
		self.init();
	}

	/// Returns a snapshot of the latch word.
	#[inline]
	pub fn word(&self) -> LatchWord {
		LatchWord::from_raw(self.word.load(Ordering::Acquire))
	}

	#[inline]
	pub fn is_unlocked(&self) -> bool {
		self.word().is_unlocked()
	}

	/// Number of cleanups currently running on this latch.
	#[inline]
	pub fn cleanup_depth(&self) -> i32 {
		self.cleanup.load(Ordering::Acquire)
	}

	#[inline]
	pub fn is_cleanup_in_progress(&self) -> bool {
		self.cleanup_depth() > 0
	}

	/// Raises (`true`) or lowers (`false`) the cleanup gate.
	///
	/// The gate is a counter so nested cleanups compose; lowering it below
	/// zero is clamped.
	pub fn set_cleanup_in_progress(&self, in_progress: bool) {
		let update = self.cleanup.fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
			if in_progress {
				Some(depth.saturating_add(1))
			} else {
				Some((depth - 1).max(0))
			}
		});
		let previous = match update {
			Ok(depth) | Err(depth) => depth,
		};
		debug!(in_progress, previous, "cleanup gate changed");
	}

	#[inline]
	pub(crate) fn cas(&self, current: LatchWord, new: LatchWord) -> bool {
		self.word
			.compare_exchange(current.into_raw(), new.into_raw(), Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	#[inline]
	fn check_gate(&self, session: SessionId) -> Result<()> {
		check_session(session)?;
		if self.is_cleanup_in_progress() {
			debug!(session, "latch acquisition refused, cleanup in progress");
			return Err(Error::LockTimeout(TimeoutCause::CleanupInProgress));
		}
		Ok(())
	}

	// -----------------------------------------------------------------------
	// Single attempts
	// -----------------------------------------------------------------------

	fn attempt_shared(&self) -> Result<Attempt> {
		let current = self.word();
		match current.state() {
			LatchState::Shared {
				count,
			} if count < u32::MAX => {
				if self.cas(current, current.with_shared_count(count + 1)) {
					Ok(Attempt::Done)
				} else {
					Ok(Attempt::Raced)
				}
			}
			LatchState::Invalid {
				raw,
			} => Err(corrupt(raw)),
			_ => Ok(Attempt::Wait),
		}
	}

	fn attempt_exclusive(&self, session: SessionId) -> Result<Attempt> {
		let current = self.word();
		let next = match current.state() {
			LatchState::Shared {
				count: 0,
			} => LatchWord::exclusive_acquired(session),
			LatchState::Shared {
				count,
			} => {
				return if self.cas(current, LatchWord::exclusive_blocked(session, count)) {
					trace!(session, readers = count, "exclusive latch blocked new readers");
					Ok(Attempt::Blocked)
				} else {
					Ok(Attempt::Raced)
				};
			}
			LatchState::ExclusiveBlocked {
				owner,
				count: 0,
			} if owner == session => LatchWord::exclusive_acquired(session),
			LatchState::ExclusiveBlocked {
				owner,
				..
			} if owner == session => return Ok(Attempt::Draining),
			LatchState::ExclusiveAcquired {
				owner,
			} if owner == session => return Err(self_deadlock(session)),
			LatchState::ExclusiveBlocked {
				..
			}
			| LatchState::ExclusiveAcquired {
				..
			} => return Ok(Attempt::Wait),
			LatchState::Invalid {
				raw,
			} => return Err(corrupt(raw)),
		};

		if self.cas(current, next) {
			Ok(Attempt::Done)
		} else {
			Ok(Attempt::Raced)
		}
	}

	/// Mutex-style attempt: only an unlocked word can be taken.
	fn attempt_mutex(&self, owner: SessionId) -> Result<Attempt> {
		let current = self.word();
		match current.state() {
			_ if current.is_unlocked() => {
				if self.cas(current, LatchWord::exclusive_acquired(owner)) {
					Ok(Attempt::Done)
				} else {
					Ok(Attempt::Raced)
				}
			}
			LatchState::ExclusiveAcquired {
				owner: holder,
			} if holder == owner && owner != NO_SESSION => Err(self_deadlock(owner)),
			LatchState::Invalid {
				raw,
			} => Err(corrupt(raw)),
			_ => Ok(Attempt::Wait),
		}
	}

	// -----------------------------------------------------------------------
	// Spin loops
	// -----------------------------------------------------------------------

	fn spin(&self, mut backoff: Backoff<'_>, mut attempt: impl FnMut() -> Result<Attempt>) -> Result<()> {
		loop {
			match attempt()? {
				Attempt::Done => return Ok(()),
				Attempt::Blocked | Attempt::Raced => continue,
				Attempt::Draining | Attempt::Wait => {
					backoff.snooze();
				}
			}
		}
	}

	fn spin_interruptible<S: Session + ?Sized>(
		&self,
		config: &LatchConfig,
		mut backoff: Backoff<'_>,
		session: &S,
		mut attempt: impl FnMut() -> Result<Attempt>,
	) -> Result<()> {
		let deadline = config.interruptible_timeout.map(|timeout| Instant::now() + timeout);
		loop {
			if session.is_interrupted() {
				debug!(session = session.id(), "latch acquisition interrupted");
				return Err(Error::LockInterrupted {
					session: session.id(),
				});
			}

			match attempt()? {
				Attempt::Done => return Ok(()),
				Attempt::Blocked | Attempt::Raced => continue,
				Attempt::Draining | Attempt::Wait => {
					if backoff.snooze() && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
						debug!(session = session.id(), "latch acquisition deadline elapsed");
						return Err(Error::LockTimeout(TimeoutCause::Deadline));
					}
				}
			}
		}
	}

	// -----------------------------------------------------------------------
	// Shared acquisition
	// -----------------------------------------------------------------------

	/// Acquires the latch in shared mode, spinning while a writer holds or
	/// blocks it.
	pub fn lock_shared(&self, config: &LatchConfig, session: SessionId) -> Result<()> {
		self.check_gate(session)?;
		self.spin(Backoff::shared(config), || self.attempt_shared())?;
		trace!(session, "shared latch acquired");
		Ok(())
	}

	/// Makes one attempt at a shared acquisition.
	///
	/// Returns [`Error::LockBusy`] when a writer holds or blocks the latch, or
	/// when another thread changed the word between the read and the CAS.
	pub fn try_lock_shared(&self, session: SessionId) -> Result<()> {
		self.check_gate(session)?;
		match self.attempt_shared()? {
			Attempt::Done => {
				trace!(session, "shared latch acquired");
				Ok(())
			}
			_ => Err(Error::LockBusy),
		}
	}

	/// Like [`Latch::lock_shared`], but gives up when `session` is interrupted
	/// or the configured deadline elapses.
	pub fn lock_shared_interruptible<S: Session + ?Sized>(&self, config: &LatchConfig, session: &S) -> Result<()> {
		self.check_gate(session.id())?;
		self.spin_interruptible(config, Backoff::shared(config), session, || self.attempt_shared())?;
		trace!(session = session.id(), "shared latch acquired");
		Ok(())
	}

	// -----------------------------------------------------------------------
	// Exclusive acquisition
	// -----------------------------------------------------------------------

	/// Acquires the latch exclusively.
	///
	/// If readers hold the latch, the word first moves to
	/// `ExclusiveBlocked(session, readers)` so no new reader gets in, then the
	/// call spins until the readers have released.
	pub fn lock_exclusive(&self, config: &LatchConfig, session: SessionId) -> Result<()> {
		self.check_gate(session)?;
		self.spin(Backoff::exclusive(config), || self.attempt_exclusive(session))?;
		trace!(session, "exclusive latch acquired");
		Ok(())
	}

	/// Makes one attempt at an exclusive acquisition. Only an unlocked latch
	/// can be taken; readers are not blocked.
	pub fn try_lock_exclusive(&self, session: SessionId) -> Result<()> {
		self.check_gate(session)?;
		match self.attempt_mutex(session)? {
			Attempt::Done => {
				trace!(session, "exclusive latch acquired");
				Ok(())
			}
			_ => Err(Error::LockBusy),
		}
	}

	/// Performs one step of the exclusive protocol without spinning.
	///
	/// The first call against a latch with readers blocks new readers and
	/// returns [`ExclusiveProgress::Blocked`]; a later call by the same
	/// session completes the acquisition once the readers are gone. A caller
	/// that gives up in between must call [`Latch::withdraw_exclusive`].
	pub fn try_advance_exclusive(&self, session: SessionId) -> Result<ExclusiveProgress> {
		self.check_gate(session)?;
		match self.attempt_exclusive(session)? {
			Attempt::Done => {
				trace!(session, "exclusive latch acquired");
				Ok(ExclusiveProgress::Acquired)
			}
			Attempt::Blocked | Attempt::Draining => Ok(ExclusiveProgress::Blocked),
			Attempt::Raced | Attempt::Wait => Err(Error::LockBusy),
		}
	}

	/// Like [`Latch::lock_exclusive`], but gives up when `session` is
	/// interrupted or the configured deadline elapses.
	///
	/// If this call had blocked new readers before giving up, the block is
	/// withdrawn so the latch returns to plain shared mode.
	pub fn lock_exclusive_interruptible<S: Session + ?Sized>(&self, config: &LatchConfig, session: &S) -> Result<()> {
		let id = session.id();
		self.check_gate(id)?;

		let mut blocked = false;
		let result = self.spin_interruptible(config, Backoff::exclusive(config), session, || {
			let attempt = self.attempt_exclusive(id)?;
			if matches!(attempt, Attempt::Blocked) {
				blocked = true;
			}
			Ok(attempt)
		});

		match result {
			Ok(()) => {
				trace!(session = id, "exclusive latch acquired");
				Ok(())
			}
			Err(err) => {
				if blocked {
					self.withdraw_exclusive(id);
				}
				Err(err)
			}
		}
	}

	/// Reverts `ExclusiveBlocked(session, n)` to `Shared(n)`.
	///
	/// Returns `false` when the word is not blocked by `session`, in which
	/// case it is left alone.
	pub fn withdraw_exclusive(&self, session: SessionId) -> bool {
		loop {
			let current = self.word();
			match current.state() {
				LatchState::ExclusiveBlocked {
					owner,
					count,
				} if owner == session => {
					if self.cas(current, LatchWord::shared(count)) {
						debug!(session, readers = count, "exclusive request withdrawn");
						return true;
					}
				}
				_ => return false,
			}
		}
	}

	// -----------------------------------------------------------------------
	// Mutex-style acquisition
	// -----------------------------------------------------------------------

	/// Acquires the latch as a plain mutex owned by `session`.
	///
	/// Waits for the word to be exactly unlocked and never blocks readers, so
	/// it is only suitable for latches that are not also used in shared mode.
	pub fn lock_mutex(&self, config: &LatchConfig, session: SessionId) -> Result<()> {
		self.check_gate(session)?;
		self.spin(Backoff::exclusive(config), || self.attempt_mutex(session))?;
		trace!(session, "mutex latch acquired");
		Ok(())
	}

	/// Like [`Latch::lock_mutex`], but gives up when `session` is interrupted
	/// or the configured deadline elapses.
	pub fn lock_mutex_interruptible<S: Session + ?Sized>(&self, config: &LatchConfig, session: &S) -> Result<()> {
		let id = session.id();
		self.check_gate(id)?;
		self.spin_interruptible(config, Backoff::exclusive(config), session, || self.attempt_mutex(id))?;
		trace!(session = id, "mutex latch acquired");
		Ok(())
	}

	/// Acquires the latch as a plain mutex for code that does not track
	/// sessions, such as backup and recovery. Release with
	/// [`Latch::unlock_no_session`].
	pub fn lock_exclusive_no_session(&self, config: &LatchConfig) -> Result<()> {
		self.check_gate(NO_SESSION)?;
		self.spin(Backoff::exclusive(config), || self.attempt_mutex(NO_SESSION))?;
		trace!("no-session latch acquired");
		Ok(())
	}

	// -----------------------------------------------------------------------
	// Release
	// -----------------------------------------------------------------------

	/// Releases one hold of `session` on the latch.
	///
	/// In shared or blocked mode this gives back one reader. In exclusive
	/// mode only the owner may release; anything else is reported as
	/// [`Violation::ReleaseByNonOwner`] and leaves the latch untouched.
	pub fn unlock(&self, session: SessionId) -> Result<()> {
		check_session(session)?;
		loop {
			let current = self.word();
			let next = match current.state() {
				LatchState::Shared {
					count,
				}
				| LatchState::ExclusiveBlocked {
					count,
					..
				} => {
					if count == 0 {
						warn!(session, word = ?current, "latch released without shared holders");
						return Ok(());
					}
					current.with_shared_count(count - 1)
				}
				LatchState::ExclusiveAcquired {
					owner,
				} if owner == session => LatchWord::UNLOCKED,
				LatchState::ExclusiveAcquired {
					owner,
				} => {
					error!(session, owner, "exclusive latch released by a session that does not own it");
					return Err(Violation::ReleaseByNonOwner {
						session,
						owner,
					}
					.into());
				}
				LatchState::Invalid {
					raw,
				} => return Err(corrupt(raw)),
			};

			if self.cas(current, next) {
				trace!(session, from = ?current, to = ?next, "latch released");
				return Ok(());
			}
		}
	}

	/// Unconditionally unlocks the latch. Pairs with
	/// [`Latch::lock_exclusive_no_session`].
	pub fn unlock_no_session(&self) {
		let previous = LatchWord::from_raw(self.word.swap(LatchWord::UNLOCKED.into_raw(), Ordering::AcqRel));
		trace!(from = ?previous, "no-session latch released");
	}

	// -----------------------------------------------------------------------
	// Guards
	// -----------------------------------------------------------------------

	/// Locks the latch in shared mode and returns a guard that releases it on
	/// drop.
	pub fn shared(&self, config: &LatchConfig, session: SessionId) -> Result<SharedGuard<'_>> {
		self.lock_shared(config, session)?;
		Ok(SharedGuard {
			latch: self,
			session,
		})
	}

	/// Locks the latch exclusively and returns a guard that releases it on
	/// drop.
	pub fn exclusive(&self, config: &LatchConfig, session: SessionId) -> Result<ExclusiveGuard<'_>> {
		self.lock_exclusive(config, session)?;
		Ok(ExclusiveGuard {
			latch: self,
			session,
		})
	}
}

impl Default for Latch {
	fn default() -> Self {
		Latch::new()
	}
}

impl fmt::Debug for Latch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Latch").field("word", &self.word()).field("cleanup", &self.cleanup_depth()).finish()
	}
}

/// Rejects ids the owner field would truncate.
#[inline]
pub(crate) fn check_session(session: SessionId) -> Result<()> {
	if session > MAX_SESSION_ID {
		error!(session, max = MAX_SESSION_ID, "session id does not fit the latch word");
		return Err(Violation::SessionOutOfRange(session).into());
	}
	Ok(())
}

fn corrupt(raw: u64) -> Error {
	error!(word = format_args!("{raw:#018x}"), "latch word carries an undefined mode");
	Violation::CorruptWord(raw).into()
}

fn self_deadlock(session: SessionId) -> Error {
	error!(session, "exclusive latch requested again by its owner");
	Error::SelfDeadlock {
		session,
	}
}

/// RAII structure used to release a shared hold on a latch when dropped.
#[must_use = "the latch is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
	latch: &'a Latch,
	session: SessionId,
}

impl<'a> SharedGuard<'a> {
	/// Releases the latch, reporting the outcome instead of logging it.
	pub fn unlock(self) -> Result<()> {
		let guard = ManuallyDrop::new(self);
		guard.latch.unlock(guard.session)
	}

	/// Returns a reference to the guarded `Latch`
	pub fn latch(&self) -> &'a Latch {
		self.latch
	}
}

impl<'a> Drop for SharedGuard<'a> {
	fn drop(&mut self) {
		if let Err(err) = self.latch.unlock(self.session) {
			error!(session = self.session, %err, "failed to release shared latch guard");
		}
	}
}

/// RAII structure used to release an exclusive hold on a latch when dropped.
#[must_use = "the latch is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
	latch: &'a Latch,
	session: SessionId,
}

impl<'a> ExclusiveGuard<'a> {
	/// Releases the latch, reporting the outcome instead of logging it.
	pub fn unlock(self) -> Result<()> {
		let guard = ManuallyDrop::new(self);
		guard.latch.unlock(guard.session)
	}

	/// Returns a reference to the guarded `Latch`
	pub fn latch(&self) -> &'a Latch {
		self.latch
	}
}

impl<'a> Drop for ExclusiveGuard<'a> {
	fn drop(&mut self) {
		if let Err(err) = self.latch.unlock(self.session) {
			error!(session = self.session, %err, "failed to release exclusive latch guard");
		}
	}
}
