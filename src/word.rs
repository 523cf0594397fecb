//! The packed 64-bit latch word.
//!
//! ```text
//! |-----------|------------|----------------------------|
//! |  4 bits   |  28 bits   |          32 bits           |
//! |-----------|------------|----------------------------|
//! | 0000 (S)  |     0      |        shared count        |
//! | 0001 (X)  | session id |             0              |
//! | 0010 (SX) | session id |        shared count        |
//! |-----------|------------|----------------------------|
//! ```
//!
//! All three fields live in one word so that every transition is a single
//! compare-and-swap. The raw value `0` is the unlocked latch.

use std::fmt;

/// Identifier of the session acquiring a latch. Only the low 28 bits are stored.
pub type SessionId = u32;

/// The largest session id that fits in the owner field.
pub const MAX_SESSION_ID: SessionId = 0x0FFF_FFFF;

/// Owner recorded by the no-session mutex path used by backup and recovery.
pub const NO_SESSION: SessionId = MAX_SESSION_ID;

const MODE_SHIFT: u32 = 60;
const SESSION_SHIFT: u32 = 32;

const MODE_MASK: u64 = 0xF000_0000_0000_0000;
const SESSION_MASK: u64 = 0x0FFF_FFFF_0000_0000;
const COUNT_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// The mode field of a latch word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
	/// Readers only; a zero count is the unlocked latch.
	Shared = 0,
	/// A single session holds the latch exclusively.
	ExclusiveAcquired = 1,
	/// A session announced exclusive intent and waits for readers to drain.
	ExclusiveBlocked = 2,
}

impl Mode {
	fn from_bits(bits: u8) -> Option<Mode> {
		match bits {
			0 => Some(Mode::Shared),
			1 => Some(Mode::ExclusiveAcquired),
			2 => Some(Mode::ExclusiveBlocked),
			_ => None,
		}
	}
}

/// A typed view of a [`LatchWord`], convenient for matching on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
	Shared {
		count: u32,
	},
	ExclusiveAcquired {
		owner: SessionId,
	},
	ExclusiveBlocked {
		owner: SessionId,
		count: u32,
	},
	/// The mode bits hold a value outside of [`Mode`].
	Invalid {
		raw: u64,
	},
}

/// A snapshot of the latch word.
///
/// This is a plain value; the atomic lives in [`crate::Latch`]. Constructors
/// build well-formed words only, so the owner of a shared word is always zero
/// and the count of an acquired word is always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LatchWord(u64);

impl LatchWord {
	/// The unlocked latch: shared mode, no owner, no readers.
	pub const UNLOCKED: LatchWord = LatchWord(0);

	#[inline]
	pub const fn from_raw(raw: u64) -> LatchWord {
		LatchWord(raw)
	}

	#[inline]
	pub const fn into_raw(self) -> u64 {
		self.0
	}

	#[inline]
	const fn pack(mode: Mode, session: SessionId, count: u32) -> LatchWord {
		LatchWord(
			((mode as u64) << MODE_SHIFT)
				| (((session as u64) << SESSION_SHIFT) & SESSION_MASK)
				| count as u64,
		)
	}

	/// A shared word with `count` readers.
	#[inline]
	pub const fn shared(count: u32) -> LatchWord {
		LatchWord::pack(Mode::Shared, 0, count)
	}

	/// A word exclusively held by `owner`.
	#[inline]
	pub const fn exclusive_acquired(owner: SessionId) -> LatchWord {
		LatchWord::pack(Mode::ExclusiveAcquired, owner, 0)
	}

	/// A word where `owner` blocks new readers while `count` readers drain.
	#[inline]
	pub const fn exclusive_blocked(owner: SessionId, count: u32) -> LatchWord {
		LatchWord::pack(Mode::ExclusiveBlocked, owner, count)
	}

	/// The raw mode bits, including values that do not map to a [`Mode`].
	#[inline]
	pub const fn mode_bits(self) -> u8 {
		((self.0 & MODE_MASK) >> MODE_SHIFT) as u8
	}

	#[inline]
	pub fn mode(self) -> Option<Mode> {
		Mode::from_bits(self.mode_bits())
	}

	#[inline]
	pub const fn session_id(self) -> SessionId {
		((self.0 & SESSION_MASK) >> SESSION_SHIFT) as SessionId
	}

	#[inline]
	pub const fn shared_count(self) -> u32 {
		(self.0 & COUNT_MASK) as u32
	}

	#[inline]
	pub const fn is_unlocked(self) -> bool {
		self.0 == 0
	}

	/// The same word with its shared count replaced.
	#[inline]
	pub const fn with_shared_count(self, count: u32) -> LatchWord {
		LatchWord((self.0 & !COUNT_MASK) | count as u64)
	}

	/// Decodes the word into a [`LatchState`].
	#[inline]
	pub fn state(self) -> LatchState {
		match self.mode() {
			Some(Mode::Shared) => LatchState::Shared {
				count: self.shared_count(),
			},
			Some(Mode::ExclusiveAcquired) => LatchState::ExclusiveAcquired {
				owner: self.session_id(),
			},
			Some(Mode::ExclusiveBlocked) => LatchState::ExclusiveBlocked {
				owner: self.session_id(),
				count: self.shared_count(),
			},
			None => LatchState::Invalid {
				raw: self.0,
			},
		}
	}
}

impl From<LatchState> for LatchWord {
	fn from(state: LatchState) -> LatchWord {
		match state {
			LatchState::Shared {
				count,
			} => LatchWord::shared(count),
			LatchState::ExclusiveAcquired {
				owner,
			} => LatchWord::exclusive_acquired(owner),
			LatchState::ExclusiveBlocked {
				owner,
				count,
			} => LatchWord::exclusive_blocked(owner, count),
			LatchState::Invalid {
				raw,
			} => LatchWord::from_raw(raw),
		}
	}
}

impl fmt::Debug for LatchWord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.state() {
			LatchState::Shared {
				count: 0,
			} => write!(f, "Unlocked"),
			LatchState::Shared {
				count,
			} => write!(f, "Shared({count})"),
			LatchState::ExclusiveAcquired {
				owner,
			} => write!(f, "ExclusiveAcquired(owner={owner})"),
			LatchState::ExclusiveBlocked {
				owner,
				count,
			} => write!(f, "ExclusiveBlocked(owner={owner}, count={count})"),
			LatchState::Invalid {
				raw,
			} => write!(f, "Invalid({raw:#018x})"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlocked_is_zero() {
		assert_eq!(LatchWord::UNLOCKED.into_raw(), 0);
		assert_eq!(LatchWord::shared(0), LatchWord::UNLOCKED);
		assert!(LatchWord::UNLOCKED.is_unlocked());
		assert_eq!(
			LatchWord::UNLOCKED.state(),
			LatchState::Shared {
				count: 0
			}
		);
	}

	#[test]
	fn layout_matches_bit_diagram() {
		assert_eq!(LatchWord::shared(3).into_raw(), 0x0000_0000_0000_0003);
		assert_eq!(LatchWord::exclusive_acquired(5).into_raw(), 0x1000_0005_0000_0000);
		assert_eq!(LatchWord::exclusive_blocked(9, 2).into_raw(), 0x2000_0009_0000_0002);
	}

	#[test]
	fn fields_decode_independently() {
		let word = LatchWord::exclusive_blocked(MAX_SESSION_ID, u32::MAX);
		assert_eq!(word.mode(), Some(Mode::ExclusiveBlocked));
		assert_eq!(word.session_id(), MAX_SESSION_ID);
		assert_eq!(word.shared_count(), u32::MAX);
	}

	#[test]
	fn session_id_is_truncated_to_28_bits() {
		let word = LatchWord::exclusive_acquired(0xFFFF_FFFF);
		assert_eq!(word.session_id(), MAX_SESSION_ID);
		assert_eq!(word.mode(), Some(Mode::ExclusiveAcquired));
	}

	#[test]
	fn with_shared_count_preserves_mode_and_owner() {
		let word = LatchWord::exclusive_blocked(9, 3).with_shared_count(1);
		assert_eq!(
			word.state(),
			LatchState::ExclusiveBlocked {
				owner: 9,
				count: 1
			}
		);
	}

	#[test]
	fn undefined_mode_bits_decode_as_invalid() {
		let raw = 0x3000_0000_0000_0000;
		let word = LatchWord::from_raw(raw);
		assert_eq!(word.mode(), None);
		assert_eq!(word.mode_bits(), 3);
		assert_eq!(
			word.state(),
			LatchState::Invalid {
				raw
			}
		);
	}

	#[test]
	fn state_converts_back_to_the_same_word() {
		for word in [
			LatchWord::UNLOCKED,
			LatchWord::shared(7),
			LatchWord::exclusive_acquired(42),
			LatchWord::exclusive_blocked(42, 7),
			LatchWord::from_raw(0xF000_0000_0000_0001),
		] {
			assert_eq!(LatchWord::from(word.state()), word);
		}
	}

	#[test]
	fn debug_output_names_the_state() {
		assert_eq!(format!("{:?}", LatchWord::UNLOCKED), "Unlocked");
		assert_eq!(format!("{:?}", LatchWord::shared(2)), "Shared(2)");
		assert_eq!(
			format!("{:?}", LatchWord::exclusive_blocked(9, 2)),
			"ExclusiveBlocked(owner=9, count=2)"
		);
	}
}
