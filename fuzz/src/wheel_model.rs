//! Operation-sequence harness for the wheel.
//!
//! Runs a real [`Wheel`] over a private heap region, mirrors the expected
//! queue contents in plain collections, and checks after every operation:
//!
//! - containment: every live slice ends inside the arena;
//! - no overlap: live slices occupy pairwise-disjoint unit ranges;
//! - emptiness: the packed pair is the sentinel exactly when nothing is live;
//! - FIFO: `peek` returns the oldest committed slice, byte for byte;
//! - progress: an allocation that fits an empty wheel never fails.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;

use carousel::{Wheel, WheelOffset, ALIGN};

/// Smallest region exercised, in [`ALIGN`] units (header included).
pub const MIN_UNITS: u32 = 2;
/// Largest region exercised; small arenas wrap more often.
pub const MAX_UNITS: u32 = 32;

/// One step of a producer/consumer interleaving.
#[derive(Clone, Copy, Debug)]
pub enum WheelOp {
    /// Allocate a slice of this many payload bytes and fill it.
    Alloc(u16),
    /// Commit the oldest allocated-but-uncommitted slice, if any.
    Commit,
    /// Peek, verify the payload, and release, if anything is committed.
    Drain,
}

struct LiveSlice {
    offset: WheelOffset,
    payload: Vec<u8>,
}

/// 64-byte-aligned zeroed heap region standing in for a shared mapping.
struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, ALIGN).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the stored layout.
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// Execute `ops` against a wheel of `region_units` alignment units and
/// verify invariants after every step.
pub fn execute_and_verify(region_units: u32, ops: &[WheelOp]) -> Result<(), String> {
    let region_units = region_units.clamp(MIN_UNITS, MAX_UNITS);
    let region = Region::new(region_units as usize * ALIGN);
    // SAFETY: fresh exclusive region of the stated size.
    let wheel = unsafe {
        Wheel::init(region.ptr, region_units as usize * ALIGN)
            .map_err(|e| format!("init failed: {e}"))?
    };

    let mut uncommitted: VecDeque<LiveSlice> = VecDeque::new();
    let mut committed: VecDeque<LiveSlice> = VecDeque::new();
    let mut fill: u8 = 0;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            WheelOp::Alloc(size) => {
                let size = size as usize;
                let was_empty = uncommitted.is_empty() && committed.is_empty();
                match wheel.alloc(size) {
                    Some(mut slice) => {
                        fill = fill.wrapping_add(1);
                        slice.payload_mut().fill(fill);
                        uncommitted.push_back(LiveSlice {
                            offset: slice.offset(),
                            payload: vec![fill; size],
                        });
                    }
                    None => {
                        // A fitting request must succeed when nothing is live.
                        if was_empty && carousel::aligned_units(size).is_some_and(|units| units <= wheel.capacity())
                        {
                            return Err(format!(
                                "op {i}: alloc({size}) failed on an empty wheel of {} units",
                                wheel.capacity()
                            ));
                        }
                    }
                }
            }
            WheelOp::Commit => {
                if let Some(slice) = uncommitted.pop_front() {
                    wheel.commit(slice.offset);
                    committed.push_back(slice);
                }
            }
            WheelOp::Drain => match committed.pop_front() {
                Some(expected) => {
                    let slice = wheel
                        .peek()
                        .ok_or_else(|| format!("op {i}: committed slice not peekable"))?;
                    if slice.offset() != expected.offset {
                        return Err(format!(
                            "op {i}: peeked offset {} but {} is oldest",
                            slice.offset(),
                            expected.offset
                        ));
                    }
                    if slice.payload() != expected.payload.as_slice() {
                        return Err(format!("op {i}: payload mismatch at offset {}", expected.offset));
                    }
                    let released = wheel.release(expected.offset);
                    if released == 0 {
                        return Err(format!("op {i}: release reclaimed nothing"));
                    }
                }
                None => {
                    if committed.is_empty() && wheel.peek().is_some() {
                        return Err(format!("op {i}: peek found a slice nothing committed"));
                    }
                }
            },
        }

        verify_invariants(&wheel, &uncommitted, &committed, i)?;
    }

    Ok(())
}

fn verify_invariants(
    wheel: &Wheel,
    uncommitted: &VecDeque<LiveSlice>,
    committed: &VecDeque<LiveSlice>,
    op_idx: usize,
) -> Result<(), String> {
    let capacity = wheel.capacity();
    let live: Vec<&LiveSlice> = committed.iter().chain(uncommitted.iter()).collect();

    // Emptiness: sentinel pair exactly when no slice is live.
    if wheel.is_empty() != live.is_empty() {
        return Err(format!(
            "after op {op_idx}: wheel empty={} but {} slices live",
            wheel.is_empty(),
            live.len()
        ));
    }

    // Containment and pairwise disjointness, using each slice's current
    // occupied size (backfill may have enlarged it).
    let spans: Vec<(u32, u32)> = live
        .iter()
        .map(|slice| {
            let status = wheel.slice_status(slice.offset);
            (slice.offset, slice.offset + status.units)
        })
        .collect();

    for &(start, end) in &spans {
        if end > capacity {
            return Err(format!(
                "after op {op_idx}: slice [{start}, {end}) leaves the {capacity}-unit arena"
            ));
        }
    }
    for (a, &(a_start, a_end)) in spans.iter().enumerate() {
        for &(b_start, b_end) in &spans[a + 1..] {
            if a_start < b_end && b_start < a_end {
                return Err(format!(
                    "after op {op_idx}: slices [{a_start}, {a_end}) and [{b_start}, {b_end}) overlap"
                ));
            }
        }
    }

    // FIFO head: the oldest committed slice is peekable; with none committed
    // the head is either absent or not yet readable.
    match (committed.front(), wheel.peek()) {
        (Some(expected), Some(peeked)) if peeked.offset() != expected.offset => Err(format!(
            "after op {op_idx}: head is {} but oldest committed is {}",
            peeked.offset(),
            expected.offset
        )),
        (Some(_), None) => Err(format!("after op {op_idx}: committed head not peekable")),
        (None, Some(peeked)) => Err(format!(
            "after op {op_idx}: peek returned {} with nothing committed",
            peeked.offset()
        )),
        _ => Ok(()),
    }
}
