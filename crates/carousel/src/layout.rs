//! Shared-memory layout definitions.
//!
//! This module defines the `repr(C)` structures that live inside the shared
//! region. These are the canonical layouts; both processes map the same bytes
//! and must agree on every field offset.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Wheel header (64 bytes, cache-line aligned)                         │
//! │    - aligned_capacity, head/last offset pair, readiness flags        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Slice arena (aligned_capacity × 64 bytes)                           │
//! │    - each slice: 16-byte header + payload, padded to 64 bytes        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every internal reference is a 32-bit offset counted in [`ALIGN`]-sized
//! units from the start of the arena. Pointers never cross the process
//! boundary; each side resolves offsets against its own mapping base.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Alignment unit: every slice starts and ends on a 64-byte boundary.
///
/// 64 is the cache line size on the targets we care about, and
/// `64 * (u32::MAX - 1)` leaves ample headroom for region sizes.
pub const ALIGN: usize = 64;

/// Offset of a slice inside the arena, counted in [`ALIGN`] units.
pub type WheelOffset = u32;

/// Sentinel offset meaning "no such slice".
pub const INVALID_OFFSET: WheelOffset = u32::MAX;

/// Packed `(head, last)` pair with both halves invalid: the empty wheel.
pub(crate) const INVALID_PAIR: u64 = u64::MAX;

// The head half of `head_last` is addressed as the low 32 bits of the packed
// u64 (see `WheelHeader::store_head`). That only lines up on little-endian
// targets.
const _: () = assert!(cfg!(target_endian = "little"));

// =============================================================================
// Offset pair
// =============================================================================

/// The `(head, last)` offsets of the oldest and newest live slices.
///
/// Packed into 64 bits so the empty→non-empty transition (producer) and the
/// non-empty→empty transition (consumer) each touch both halves in a single
/// atomic step. Either both offsets are valid or both are [`INVALID_OFFSET`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OffsetPair {
    pub head: WheelOffset,
    pub last: WheelOffset,
}

impl OffsetPair {
    #[inline]
    pub fn pack(self) -> u64 {
        (self.head as u64) | ((self.last as u64) << 32)
    }

    #[inline]
    pub fn unpack(bits: u64) -> Self {
        Self {
            head: bits as u32,
            last: (bits >> 32) as u32,
        }
    }

    /// True when the pair is the all-ones sentinel (no live slices).
    #[inline]
    pub fn is_invalid(self) -> bool {
        self.pack() == INVALID_PAIR
    }
}

// =============================================================================
// Wheel header
// =============================================================================

/// Header at the start of the shared region (one [`ALIGN`] unit).
///
/// `aligned_capacity` is written once at initialization and never again.
/// `head_last` is the packed offset pair; the producer installs new `last`
/// values and the consumer advances `head`. The readiness flags are only
/// meaningful when the wheel was initialized for notification.
#[repr(C, align(64))]
pub struct WheelHeader {
    /// Usable arena size after the header, in [`ALIGN`] units.
    pub(crate) aligned_capacity: u32,
    _reserved: u32,
    /// Packed [`OffsetPair`]; [`INVALID_PAIR`] when the wheel is empty.
    pub(crate) head_last: AtomicU64,
    /// 1 iff a slice has been committed since the consumer last saw empty.
    pub(crate) is_readable: AtomicU8,
    /// 1 iff the last allocation attempt succeeded (or none failed yet).
    pub(crate) is_writable: AtomicU8,
}

const _: () = assert!(std::mem::size_of::<WheelHeader>() == ALIGN);

impl WheelHeader {
    #[inline]
    pub(crate) fn load_pair(&self, order: Ordering) -> OffsetPair {
        OffsetPair::unpack(self.head_last.load(order))
    }

    /// Store a new head offset without touching `last`.
    ///
    /// Only the consumer calls this, and only while the wheel is non-empty,
    /// so the 32-bit store cannot race with another head writer. The producer
    /// may concurrently compare-exchange the full pair; its CAS simply fails
    /// and reloads.
    #[inline]
    pub(crate) fn store_head(&self, head: WheelOffset) {
        let low = &self.head_last as *const AtomicU64 as *const AtomicU32;
        // SAFETY: `low` points at the first four bytes of `head_last`, which
        // are 4-aligned and hold the head half on little-endian targets
        // (asserted above).
        unsafe { (*low).store(head, Ordering::Release) }
    }
}

// =============================================================================
// Slice header
// =============================================================================

/// Lifecycle of a slice inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceState {
    /// Allocated by the producer, payload not yet published.
    Uninit = 0,
    /// Published; the consumer may read the payload.
    Readable = 1,
    /// Handed back by the consumer; the space is reclaimable.
    Returned = 2,
}

impl SliceState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Uninit),
            1 => Some(Self::Readable),
            2 => Some(Self::Returned),
            _ => None,
        }
    }
}

/// Per-slice metadata embedded in the arena immediately before the payload.
///
/// `aligned_size_in_wheel` is atomic because the producer may later enlarge
/// the *previous* last slice to absorb tail space while the consumer walks the
/// wheel (see the backfill rule in [`crate::Wheel::alloc`]).
#[repr(C)]
pub struct SliceHeader {
    /// Byte count the producer asked for; at least this many bytes follow.
    pub(crate) trailing_user_size: usize,
    /// Units this slice occupies in the arena, header and padding included.
    pub(crate) aligned_size_in_wheel: AtomicU32,
    /// One of [`SliceState`].
    pub(crate) state: AtomicU8,
}

const _: () = assert!(std::mem::size_of::<SliceHeader>() == 16);
// The header must not push the first payload byte past an alignment unit.
const _: () = assert!(std::mem::size_of::<SliceHeader>() <= ALIGN);

/// Units needed for a slice carrying `user_size` payload bytes, header and
/// padding included. `None` on arithmetic overflow.
#[inline]
pub fn aligned_units(user_size: usize) -> Option<u32> {
    let total = user_size.checked_add(std::mem::size_of::<SliceHeader>())?;
    u32::try_from(total.div_ceil(ALIGN)).ok()
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from wheel initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// Region length is not a multiple of [`ALIGN`], too small to hold the
    /// header plus one slice, or too large to address with 32-bit offsets.
    BadSize { len: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadSize { len } => write!(
                f,
                "bad region size {len}: must be a multiple of {ALIGN}, at least {}, below {}",
                2 * ALIGN,
                ALIGN as u64 * (u32::MAX as u64 + 1),
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(std::mem::size_of::<WheelHeader>(), 64);
        assert_eq!(std::mem::size_of::<SliceHeader>(), 16);
    }

    #[test]
    fn pair_roundtrip() {
        let pair = OffsetPair { head: 3, last: 17 };
        assert_eq!(OffsetPair::unpack(pair.pack()), pair);
        assert_eq!(pair.pack(), 3 | (17u64 << 32));

        let empty = OffsetPair {
            head: INVALID_OFFSET,
            last: INVALID_OFFSET,
        };
        assert!(empty.is_invalid());
        assert_eq!(empty.pack(), INVALID_PAIR);
        assert!(!pair.is_invalid());
    }

    #[test]
    fn aligned_units_rounds_up() {
        // Header alone occupies one unit.
        assert_eq!(aligned_units(0), Some(1));
        assert_eq!(aligned_units(ALIGN - 16), Some(1));
        assert_eq!(aligned_units(ALIGN - 15), Some(2));
        assert_eq!(aligned_units(2 * ALIGN - 16), Some(2));
    }

    #[test]
    fn aligned_units_overflow() {
        assert_eq!(aligned_units(usize::MAX), None);
        assert_eq!(aligned_units(usize::MAX - 15), None);
    }

    #[test]
    fn slice_state_from_u8() {
        assert_eq!(SliceState::from_u8(0), Some(SliceState::Uninit));
        assert_eq!(SliceState::from_u8(1), Some(SliceState::Readable));
        assert_eq!(SliceState::from_u8(2), Some(SliceState::Returned));
        assert_eq!(SliceState::from_u8(3), None);
    }
}
