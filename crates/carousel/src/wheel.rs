//! The spin wheel: a lock-free SPSC queue of variable-sized slices.
//!
//! One producer allocates slices with [`Wheel::alloc`], fills them, and
//! publishes them with [`Wheel::commit`]. One consumer observes them in FIFO
//! order with [`Wheel::peek`] and hands them back with [`Wheel::release`].
//! All coordination happens through atomics inside the shared region; the
//! `Wheel` value itself is a per-process view and holds no state of its own.
//!
//! None of the operations block. Callers pick their own waiting discipline:
//! spin, or poll the descriptors of [`crate::NotifiedWheel`].

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crate::layout::{
    aligned_units, LayoutError, OffsetPair, SliceHeader, SliceState, WheelHeader, WheelOffset,
    ALIGN, INVALID_OFFSET, INVALID_PAIR,
};

/// Per-process view of a wheel in shared memory.
///
/// Cheap to copy around inside a process; both roles go through the same
/// type. The single-producer/single-consumer discipline is part of the
/// construction contract, not enforced at runtime.
pub struct Wheel {
    header: *mut WheelHeader,
}

// SAFETY: Wheel is a view over shared memory coordinated entirely through
// atomics. Sending or sharing the view across threads is sound as long as the
// construction contract (one producer, one consumer) holds.
unsafe impl Send for Wheel {}
unsafe impl Sync for Wheel {}

/// A writable slice handed out by [`Wheel::alloc`], not yet visible to the
/// consumer. Publish it with [`Wheel::commit`] once the payload is written.
pub struct AllocatedSlice<'a> {
    offset: WheelOffset,
    payload: *mut u8,
    len: usize,
    _wheel: PhantomData<&'a Wheel>,
}

impl AllocatedSlice<'_> {
    /// Arena offset identifying this slice; pass it to [`Wheel::commit`].
    #[inline]
    pub fn offset(&self) -> WheelOffset {
        self.offset
    }

    /// The writable payload region, exactly the requested length.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: `payload` spans `len` bytes inside the arena, the slice is
        // in Uninit state, and only this producer-side handle touches it
        // until commit.
        unsafe { std::slice::from_raw_parts_mut(self.payload, self.len) }
    }
}

/// A published slice observed by [`Wheel::peek`]. Hand it back with
/// [`Wheel::release`] once the payload has been read.
pub struct SharedSlice<'a> {
    offset: WheelOffset,
    payload: *const u8,
    len: usize,
    _wheel: PhantomData<&'a Wheel>,
}

impl SharedSlice<'_> {
    /// Arena offset identifying this slice; pass it to [`Wheel::release`].
    #[inline]
    pub fn offset(&self) -> WheelOffset {
        self.offset
    }

    /// The published payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the slice was observed Readable with acquire ordering, so
        // the producer's payload writes are visible, and the producer will
        // not touch it again before release.
        unsafe { std::slice::from_raw_parts(self.payload, self.len) }
    }
}

impl Wheel {
    /// Initialize a wheel in `region` and return a view of it.
    ///
    /// `len` must be a multiple of [`ALIGN`], at least `2 * ALIGN` (header
    /// plus one slice unit), and below `ALIGN * 2^32`. One process
    /// initializes; the other attaches with [`Wheel::attach`].
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes of `len` bytes, aligned
    ///   to [`ALIGN`], and mapped shared if another process will attach.
    /// - No other thread or process may touch the region until this returns.
    /// - Across all views of this region, at most one thread may act as
    ///   producer (`alloc`/`commit`) and at most one as consumer
    ///   (`peek`/`release`) at any time.
    pub unsafe fn init(region: *mut u8, len: usize) -> Result<Self, LayoutError> {
        if len < 2 * ALIGN || len % ALIGN != 0 || len as u64 / ALIGN as u64 > u32::MAX as u64 {
            return Err(LayoutError::BadSize { len });
        }
        debug_assert_eq!(region as usize % ALIGN, 0);

        let header = region as *mut WheelHeader;
        // SAFETY: caller guarantees exclusive access to a large-enough
        // region; these are plain initializing writes before any sharing.
        unsafe {
            (*header).aligned_capacity = (len / ALIGN - 1) as u32;
            (*header).head_last = std::sync::atomic::AtomicU64::new(INVALID_PAIR);
        }
        Ok(Self { header })
    }

    /// Like [`Wheel::init`], but also arms the readiness flags used by the
    /// notification layer: the wheel starts out unreadable and writable.
    ///
    /// Use this (and [`crate::NotifiedWheel`]) on both ends, or plain `init`
    /// on both ends; mixing the two leaves the descriptors out of sync.
    ///
    /// # Safety
    ///
    /// Same contract as [`Wheel::init`].
    pub unsafe fn init_notified(region: *mut u8, len: usize) -> Result<Self, LayoutError> {
        // SAFETY: forwarded contract.
        let wheel = unsafe { Self::init(region, len)? };
        let header = wheel.header();
        header.is_readable.store(0, Ordering::Relaxed);
        header.is_writable.store(1, Ordering::Relaxed);
        Ok(wheel)
    }

    /// Attach to a wheel some other process (or thread) already initialized.
    ///
    /// # Safety
    ///
    /// - `region` must be a shared mapping of a region on which `init` (or
    ///   `init_notified`) has completed, valid for its full length for the
    ///   lifetime of the view.
    /// - The SPSC role discipline of [`Wheel::init`] applies across both
    ///   processes.
    pub unsafe fn attach(region: *mut u8) -> Self {
        debug_assert_eq!(region as usize % ALIGN, 0);
        Self {
            header: region as *mut WheelHeader,
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &WheelHeader {
        // SAFETY: construction guarantees `header` points at an initialized
        // header that outlives this view.
        unsafe { &*self.header }
    }

    /// Usable arena size in [`ALIGN`] units.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().aligned_capacity
    }

    /// Largest payload a single slice can carry: the whole arena minus the
    /// slice header. Only an empty wheel can satisfy it.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.capacity() as usize * ALIGN - std::mem::size_of::<SliceHeader>()
    }

    /// True when no slice is live (allocated and not yet released).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header().load_pair(Ordering::Acquire).is_invalid()
    }

    #[inline]
    fn arena(&self) -> *mut u8 {
        // SAFETY: the arena starts one alignment unit past the header.
        unsafe { (self.header as *mut u8).add(ALIGN) }
    }

    /// # Safety
    ///
    /// `offset` must be below `aligned_capacity`.
    #[inline]
    unsafe fn slice_at(&self, offset: WheelOffset) -> *mut SliceHeader {
        debug_assert!(offset < self.capacity());
        // SAFETY: caller keeps the offset inside the arena.
        unsafe { self.arena().add(offset as usize * ALIGN) as *mut SliceHeader }
    }

    /// # Safety
    ///
    /// `offset` must be below `aligned_capacity`.
    #[inline]
    unsafe fn payload_at(&self, offset: WheelOffset) -> *mut u8 {
        // SAFETY: forwarded bound; the payload follows the slice header.
        unsafe { (self.slice_at(offset) as *mut u8).add(std::mem::size_of::<SliceHeader>()) }
    }

    /// Pick the arena offset for a new slice of `units`, or `None` when no
    /// free run is large enough under the pair observed in `pair`.
    fn candidate_offset(&self, units: u32, pair: OffsetPair) -> Option<WheelOffset> {
        let capacity = self.capacity();

        if pair.is_invalid() {
            return (units <= capacity).then_some(0);
        }

        let OffsetPair { head, last } = pair;
        debug_assert!(head != INVALID_OFFSET && last != INVALID_OFFSET);
        // SAFETY: `last` was published as a live slice offset.
        let last_units =
            unsafe { (*self.slice_at(last)).aligned_size_in_wheel.load(Ordering::Relaxed) };
        let last_end = last + last_units;

        if last < head {
            // Wrapped: only the hole between the live tail and the live head
            // is free.
            (units <= head - last_end).then_some(last_end)
        } else if units <= capacity - last_end {
            // Straight: room after the last slice.
            Some(last_end)
        } else if units <= head {
            // Wrap to the front; alloc must backfill the tail gap.
            Some(0)
        } else {
            None
        }
    }

    /// Allocate a slice with room for `user_size` payload bytes.
    ///
    /// Returns `None` when the size cannot be represented or no free run in
    /// the arena is large enough. The slice stays invisible to the consumer
    /// until [`Wheel::commit`].
    ///
    /// When the allocation wraps to the front of the arena, the previous last
    /// slice is enlarged to swallow the unreachable tail gap, keeping the
    /// consumer's walk contiguous.
    pub fn alloc(&self, user_size: usize) -> Option<AllocatedSlice<'_>> {
        let units = aligned_units(user_size)?;
        let header = self.header();
        if units > header.aligned_capacity {
            return None;
        }

        let mut pair = header.load_pair(Ordering::Acquire);
        let offset = self.candidate_offset(units, pair)?;

        // Backfill: a wrap leaves dead space between the old last slice and
        // the arena end that the consumer could never step across. Fold it
        // into the old last slice before the new offset becomes reachable.
        if offset == 0 && !pair.is_invalid() {
            let old_last = pair.last;
            // SAFETY: `old_last` is a live slice offset; the consumer only
            // reads this field after reaching the slice, which it has not
            // (it is still behind `head`).
            unsafe {
                (*self.slice_at(old_last))
                    .aligned_size_in_wheel
                    .store(header.aligned_capacity - old_last, Ordering::Relaxed);
            }
        }

        // Fill in the slice header before publishing the offset; the release
        // below makes these writes visible together with it.
        // SAFETY: `offset + units <= capacity` was just checked; the region
        // is free, so nothing else references it.
        unsafe {
            let slice = self.slice_at(offset);
            (*slice).trailing_user_size = user_size;
            (*slice).aligned_size_in_wheel.store(units, Ordering::Relaxed);
            (*slice).state.store(SliceState::Uninit as u8, Ordering::Relaxed);
        }

        // Publish: install `offset` as the new last, and as head too if the
        // wheel was empty.
        loop {
            if pair.is_invalid() {
                // The consumer never moves head off the sentinel, so no one
                // contends with this store.
                let fresh = OffsetPair {
                    head: offset,
                    last: offset,
                };
                header.head_last.store(fresh.pack(), Ordering::Release);
                break;
            }
            // The consumer may concurrently advance head or empty the wheel,
            // so keep whatever head we observed and swing only last.
            let desired = OffsetPair {
                head: pair.head,
                last: offset,
            };
            match header.head_last.compare_exchange(
                pair.pack(),
                desired.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => pair = OffsetPair::unpack(observed),
            }
        }

        Some(AllocatedSlice {
            offset,
            // SAFETY: offset is in bounds.
            payload: unsafe { self.payload_at(offset) },
            len: user_size,
            _wheel: PhantomData,
        })
    }

    /// Publish a slice previously returned by [`Wheel::alloc`], making it
    /// visible to the consumer.
    ///
    /// `offset` must come from this wheel's `alloc`; anything else is a
    /// caller bug (checked under `debug_assertions`).
    pub fn commit(&self, offset: WheelOffset) {
        debug_assert!(offset < self.capacity());
        // SAFETY: offset identifies a slice this producer allocated.
        let slice = unsafe { self.slice_at(offset) };
        debug_assert_eq!(
            // SAFETY: same slice.
            unsafe { (*slice).state.load(Ordering::Relaxed) },
            SliceState::Uninit as u8,
            "commit of a slice that was not freshly allocated",
        );
        // Release pairs with the acquire state load in `peek`, publishing the
        // payload bytes written since alloc.
        // SAFETY: as above.
        unsafe {
            (*slice).state.store(SliceState::Readable as u8, Ordering::Release);
        }
    }

    /// Observe the oldest published slice without consuming it.
    ///
    /// Idempotent: calling it again before [`Wheel::release`] returns the
    /// same slice. `None` when the wheel is empty or the oldest slice is not
    /// yet committed.
    pub fn peek(&self) -> Option<SharedSlice<'_>> {
        let pair = self.header().load_pair(Ordering::Acquire);
        if pair.is_invalid() {
            return None;
        }

        // SAFETY: a non-invalid head is a live slice offset.
        let slice = unsafe { self.slice_at(pair.head) };
        // Acquire pairs with the release in `commit`.
        // SAFETY: as above.
        if unsafe { (*slice).state.load(Ordering::Acquire) } != SliceState::Readable as u8 {
            return None;
        }

        // SAFETY: the slice is Readable; its header fields are stable until
        // this consumer releases it.
        let len = unsafe { (*slice).trailing_user_size };
        Some(SharedSlice {
            offset: pair.head,
            // SAFETY: head is in bounds.
            payload: unsafe { self.payload_at(pair.head) },
            len,
            _wheel: PhantomData,
        })
    }

    /// Hand a slice back to the producer and advance past any contiguous run
    /// of returned slices at the head.
    ///
    /// Returns the number of slices reclaimed. Idempotent per slice: a second
    /// release of the same offset is a no-op returning 0.
    ///
    /// The advance loop tolerates returns arriving out of producer order by
    /// stopping at the first non-returned head; with the SPSC discipline this
    /// simply reclaims the head run.
    pub fn release(&self, offset: WheelOffset) -> usize {
        let header = self.header();
        debug_assert!(offset < header.aligned_capacity);

        // SAFETY: offset identifies a slice handed out by `peek`.
        let slice = unsafe { self.slice_at(offset) };
        // SAFETY: as above.
        if unsafe { (*slice).state.swap(SliceState::Returned as u8, Ordering::AcqRel) }
            == SliceState::Returned as u8
        {
            return 0;
        }

        let mut released = 0;
        loop {
            let pair = header.load_pair(Ordering::Acquire);
            if pair.is_invalid() {
                break;
            }
            // SAFETY: a non-invalid head is a live slice offset.
            let head = unsafe { self.slice_at(pair.head) };
            // SAFETY: as above.
            if unsafe { (*head).state.load(Ordering::Acquire) } != SliceState::Returned as u8 {
                break;
            }

            if pair.head == pair.last
                && header
                    .head_last
                    .compare_exchange(
                        pair.pack(),
                        INVALID_PAIR,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                // Reclaimed the only live slice: the wheel is now empty.
            } else {
                // Either more slices follow, or the producer published a new
                // last between our load and the compare-exchange. Step head
                // over the returned slice; only this consumer writes head in
                // the non-empty case.
                // SAFETY: as above.
                let head_units =
                    unsafe { (*head).aligned_size_in_wheel.load(Ordering::Relaxed) };
                let next_head = (pair.head + head_units) % header.aligned_capacity;
                header.store_head(next_head);
            }
            released += 1;
        }
        released
    }

    /// Snapshot of the head/last pair for diagnostics and tests.
    pub fn status(&self) -> WheelStatus {
        let pair = self.header().load_pair(Ordering::Acquire);
        WheelStatus {
            head: pair.head,
            last: pair.last,
            capacity: self.capacity(),
        }
    }

    /// Snapshot of one slice's header for diagnostics and tests.
    ///
    /// Meaningful only for offsets handed out by [`Wheel::alloc`] or
    /// [`Wheel::peek`]; other offsets read whatever bytes happen to be there.
    ///
    /// # Panics
    ///
    /// Panics when `offset` is outside the arena.
    pub fn slice_status(&self, offset: WheelOffset) -> SliceStatus {
        assert!(offset < self.capacity(), "slice offset out of bounds");
        // SAFETY: bounds just checked.
        let slice = unsafe { self.slice_at(offset) };
        // SAFETY: reads of in-bounds arena memory; values may be garbage for
        // offsets that are not slice starts, which the caller accepts.
        unsafe {
            SliceStatus {
                user_size: (*slice).trailing_user_size,
                units: (*slice).aligned_size_in_wheel.load(Ordering::Relaxed),
                state: SliceState::from_u8((*slice).state.load(Ordering::Relaxed)),
            }
        }
    }
}

/// Snapshot of the wheel's offset pair.
#[derive(Debug, Clone, Copy)]
pub struct WheelStatus {
    /// Oldest live slice, or [`INVALID_OFFSET`] when empty.
    pub head: WheelOffset,
    /// Newest live slice, or [`INVALID_OFFSET`] when empty.
    pub last: WheelOffset,
    /// Arena size in [`ALIGN`] units.
    pub capacity: u32,
}

impl std::fmt::Display for WheelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.head == INVALID_OFFSET {
            write!(f, "empty (capacity {} units)", self.capacity)
        } else {
            write!(
                f,
                "head={} last={} (capacity {} units)",
                self.head, self.last, self.capacity
            )
        }
    }
}

/// Snapshot of one slice header.
#[derive(Debug, Clone, Copy)]
pub struct SliceStatus {
    /// Requested payload length in bytes.
    pub user_size: usize,
    /// Occupied arena units, header and backfill included.
    pub units: u32,
    /// Decoded state byte; `None` for an unrecognized value.
    pub state: Option<SliceState>,
}
