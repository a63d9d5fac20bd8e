//! Eventfd notification over the spin wheel.
//!
//! Wraps the four wheel operations so that a reactor can sleep instead of
//! spinning. Two counting-semaphore eventfds mirror the readiness flags in
//! the wheel header:
//!
//! - the *readable* descriptor polls readable (`POLLIN`) while at least one
//!   committed slice is waiting;
//! - the *writable* descriptor polls writable (`POLLOUT`) while an
//!   allocation that previously failed might now succeed. Its counter is
//!   parked one below the eventfd maximum, so a single "no room" token posted
//!   on allocation failure saturates it and clears `POLLOUT`.
//!
//! # Why counting semaphores
//!
//! Both ends race to toggle the flags and to post/drain the descriptors.
//! With a plain event descriptor the interleaving
//! *consumer-clears-flag, producer-sets-flag, producer-posts,
//! consumer-drains* leaves the flag at 1 but the descriptor drained, and the
//! reactor never wakes. `EFD_SEMAPHORE` accumulates the posts of both sides
//! in any order, so the descriptor level always catches back up with the
//! flag. The atomic-exchange gate on each flag makes every post and drain
//! correspond to exactly one 0↔1 flag transition.
//!
//! Descriptors are per-process: create them on one end, hand them to the
//! other over `SCM_RIGHTS` (see the companion shm crate), and rebuild with
//! [`NotifiedWheel::from_fds`] there.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;

use crate::layout::WheelOffset;
use crate::wheel::{AllocatedSlice, SharedSlice, Wheel};

/// A wheel plus this process's pair of notification descriptors.
///
/// Use this type's `alloc`/`commit`/`peek`/`release` instead of the plain
/// [`Wheel`] ones on *both* ends; mixing notified and plain calls lets the
/// descriptors drift out of sync with the queue.
pub struct NotifiedWheel {
    wheel: Wheel,
    readable: OwnedFd,
    writable: OwnedFd,
    /// Last descriptor post/drain failure, kept out of the primary results.
    signal_error: Cell<Option<io::Error>>,
}

impl NotifiedWheel {
    /// Create fresh eventfds for a wheel initialized with
    /// [`Wheel::init_notified`] (or attached to one).
    ///
    /// The descriptors are nonblocking and close-on-exec; duplicate them to
    /// the peer process explicitly.
    pub fn create(wheel: Wheel) -> io::Result<Self> {
        let flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE;
        let header = wheel.header();
        let is_readable = header.is_readable.load(Ordering::Relaxed);
        let is_writable = header.is_writable.load(Ordering::Relaxed);

        let readable = eventfd(is_readable as u32, flags)?;
        let writable = eventfd(0, flags)?;
        // Park the writable counter one below the eventfd maximum of
        // 2^64 - 2 (minus another one when a failed allocation is already
        // outstanding). The eventfd syscall only takes a 32-bit initial
        // value, so the baseline needs a follow-up write.
        efd_write(writable.as_fd(), u64::MAX - 1 - is_writable as u64)?;

        Ok(Self {
            wheel,
            readable,
            writable,
            signal_error: Cell::new(None),
        })
    }

    /// Rebuild from descriptors received from the creating process.
    ///
    /// `readable` and `writable` must be the corresponding ends of a
    /// [`NotifiedWheel::create`] pair for this same region, received in that
    /// order.
    pub fn from_fds(wheel: Wheel, readable: OwnedFd, writable: OwnedFd) -> Self {
        Self {
            wheel,
            readable,
            writable,
            signal_error: Cell::new(None),
        }
    }

    /// The wrapped wheel view.
    pub fn wheel(&self) -> &Wheel {
        &self.wheel
    }

    /// Descriptor that polls readable while a committed slice is waiting.
    /// Register it with `POLLIN` interest on the consumer side.
    pub fn readable_fd(&self) -> BorrowedFd<'_> {
        self.readable.as_fd()
    }

    /// Descriptor that polls writable while allocation may succeed.
    /// Register it with `POLLOUT` interest on the producer side.
    pub fn writable_fd(&self) -> BorrowedFd<'_> {
        self.writable.as_fd()
    }

    /// [`Wheel::alloc`], flagging "no room" to pollers on failure.
    ///
    /// A failed allocation larger than the arena while the wheel is empty
    /// leaves the wheel both unreadable and unwritable: nothing will ever
    /// wake either poller. Check the size against
    /// [`Wheel::max_payload`] first when sizes are not known to fit.
    pub fn alloc(&self, user_size: usize) -> Option<AllocatedSlice<'_>> {
        let allocated = self.wheel.alloc(user_size);
        if allocated.is_none()
            && self.wheel.header().is_writable.swap(0, Ordering::SeqCst) == 1
        {
            // Saturate the writable counter so it stops polling writable.
            self.record("writable post", efd_write(self.writable_fd(), 1));
        }
        allocated
    }

    /// [`Wheel::commit`], waking the consumer's poller on the empty→ready
    /// transition.
    pub fn commit(&self, offset: WheelOffset) {
        self.wheel.commit(offset);
        if self.wheel.header().is_readable.swap(1, Ordering::SeqCst) == 0 {
            self.record("readable post", efd_write(self.readable_fd(), 1));
        }
    }

    /// [`Wheel::peek`], parking the consumer's poller when nothing is ready.
    pub fn peek(&self) -> Option<SharedSlice<'_>> {
        let next = self.wheel.peek();
        if next.is_none() && self.wheel.header().is_readable.swap(0, Ordering::SeqCst) == 1 {
            self.record("readable drain", efd_read(self.readable_fd()));
        }
        next
    }

    /// [`Wheel::release`], waking the producer's poller now that there may be
    /// room again.
    pub fn release(&self, offset: WheelOffset) -> usize {
        let released = self.wheel.release(offset);
        if self.wheel.header().is_writable.swap(1, Ordering::SeqCst) == 0 {
            // Drain one "no room" token so the counter drops back below the
            // maximum and polls writable again.
            self.record("writable drain", efd_read(self.writable_fd()));
        }
        released
    }

    /// Take the most recent descriptor post/drain failure, if any.
    ///
    /// Descriptor failures never unwind queue state; the primary operation's
    /// result stands. Callers that care can inspect this after the fact.
    pub fn take_signal_error(&self) -> Option<io::Error> {
        self.signal_error.take()
    }

    fn record(&self, what: &str, result: io::Result<()>) {
        if let Err(err) = result {
            tracing::warn!("eventfd {what} failed: {err}");
            self.signal_error.set(Some(err));
        }
    }
}

fn eventfd(initval: u32, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: eventfd takes no pointers.
    let fd = unsafe { libc::eventfd(initval, flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: freshly created descriptor, owned by no one else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Add `value` to an eventfd counter, retrying on signal interruption.
fn efd_write(fd: BorrowedFd<'_>, value: u64) -> io::Result<()> {
    loop {
        // SAFETY: `value` is valid for 8 bytes for the duration of the call.
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Subtract one unit from a semaphore eventfd, retrying on signal
/// interruption.
fn efd_read(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut value = 0u64;
    loop {
        // SAFETY: `value` is valid for 8 writable bytes.
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestRegion;
    use crate::ALIGN;

    fn poll_events(fd: BorrowedFd<'_>, interest: libc::c_short) -> libc::c_short {
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: interest,
            revents: 0,
        };
        // SAFETY: pfd is valid for the duration of the call.
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert!(n >= 0, "poll failed: {}", io::Error::last_os_error());
        pfd.revents
    }

    fn is_pollin(fd: BorrowedFd<'_>) -> bool {
        poll_events(fd, libc::POLLIN) & libc::POLLIN != 0
    }

    fn is_pollout(fd: BorrowedFd<'_>) -> bool {
        poll_events(fd, libc::POLLOUT) & libc::POLLOUT != 0
    }

    fn notified_wheel(region: &TestRegion, len: usize) -> NotifiedWheel {
        // SAFETY: exclusive region of at least `len` bytes.
        let wheel = unsafe { Wheel::init_notified(region.as_mut_ptr(), len).unwrap() };
        NotifiedWheel::create(wheel).unwrap()
    }

    #[test]
    fn starts_writable_and_unreadable() {
        let region = TestRegion::new(1024);
        let nw = notified_wheel(&region, 1024);

        assert!(!is_pollin(nw.readable_fd()));
        assert!(is_pollout(nw.writable_fd()));
    }

    #[test]
    fn commit_wakes_reader_and_drain_parks_it() {
        let region = TestRegion::new(1024);
        let nw = notified_wheel(&region, 1024);

        let slice = nw.alloc(5).unwrap();
        let offset = slice.offset();
        assert!(!is_pollin(nw.readable_fd()), "uncommitted slice must not wake");
        nw.commit(offset);
        assert!(is_pollin(nw.readable_fd()));

        // Draining the last slice parks the readable descriptor again.
        let shared = nw.peek().unwrap();
        assert_eq!(shared.offset(), offset);
        nw.release(offset);
        assert!(nw.peek().is_none());
        assert!(!is_pollin(nw.readable_fd()));
        assert!(nw.take_signal_error().is_none());
    }

    #[test]
    fn failed_alloc_parks_writer_until_release() {
        let region = TestRegion::new(256);
        let nw = notified_wheel(&region, 256);

        // Fill the three arena units.
        let mut offsets = Vec::new();
        while let Some(slice) = nw.alloc(ALIGN - 16) {
            let offset = slice.offset();
            nw.commit(offset);
            offsets.push(offset);
        }
        assert_eq!(offsets.len(), 3);
        // The failing alloc inside the loop condition already parked the
        // writable descriptor.
        assert!(!is_pollout(nw.writable_fd()));

        // Freeing space wakes it again.
        let shared = nw.peek().unwrap();
        nw.release(shared.offset());
        assert!(is_pollout(nw.writable_fd()));
        assert!(nw.alloc(ALIGN - 16).is_some());
        assert!(nw.take_signal_error().is_none());
    }

    #[test]
    fn repeated_failures_post_once() {
        let region = TestRegion::new(128);
        let nw = notified_wheel(&region, 128);

        nw.commit(nw.alloc(1).unwrap().offset());
        for _ in 0..4 {
            assert!(nw.alloc(ALIGN).is_none());
        }
        assert!(!is_pollout(nw.writable_fd()));

        let shared = nw.peek().unwrap();
        nw.release(shared.offset());
        assert!(is_pollout(nw.writable_fd()));
        assert!(nw.take_signal_error().is_none());
    }

    #[test]
    fn oversize_alloc_on_empty_wheel_parks_both() {
        // The documented wedge: nothing to read, and no release will ever
        // arrive to un-park the writer.
        let region = TestRegion::new(256);
        let nw = notified_wheel(&region, 256);

        assert!(nw.alloc(1 << 20).is_none());
        assert!(!is_pollin(nw.readable_fd()));
        assert!(!is_pollout(nw.writable_fd()));
    }

    #[test]
    fn threaded_soak_with_poll_waiting() {
        // Two roles, two NotifiedWheel instances (as two processes would
        // have), both sleeping in poll(2) instead of spinning. Exercises the
        // flag/descriptor races the counting semaphores exist to absorb.
        const MESSAGES: u32 = 50_000;

        let region = TestRegion::new(4096);
        let producer = notified_wheel(&region, 4096);
        let consumer = NotifiedWheel::from_fds(
            // SAFETY: the region stays mapped for the whole test.
            unsafe { Wheel::attach(region.as_mut_ptr()) },
            producer.readable_fd().try_clone_to_owned().unwrap(),
            producer.writable_fd().try_clone_to_owned().unwrap(),
        );

        fn wait_for(fd: BorrowedFd<'_>, interest: libc::c_short) {
            let mut pfd = libc::pollfd {
                fd: fd.as_raw_fd(),
                events: interest,
                revents: 0,
            };
            // SAFETY: pfd is valid for the duration of the call.
            let n = unsafe { libc::poll(&mut pfd, 1, 5_000) };
            assert!(n > 0, "wheel made no progress within five seconds");
        }

        // Each instance is single-threaded by design (it is not Sync), so
        // the roles take their instance with them, as two processes would.
        std::thread::scope(|scope| {
            let producing = scope.spawn(move || {
                for seq in 0..MESSAGES {
                    let mut slice = loop {
                        match producer.alloc(4 + (seq % 13) as usize) {
                            Some(slice) => break slice,
                            None => wait_for(producer.writable_fd(), libc::POLLOUT),
                        }
                    };
                    let payload = slice.payload_mut();
                    payload[..4].copy_from_slice(&seq.to_le_bytes());
                    payload[4..].fill(seq as u8);
                    producer.commit(slice.offset());
                }
                producer.take_signal_error()
            });

            let consuming = scope.spawn(move || {
                for seq in 0..MESSAGES {
                    let slice = loop {
                        match consumer.peek() {
                            Some(slice) => break slice,
                            None => wait_for(consumer.readable_fd(), libc::POLLIN),
                        }
                    };
                    let payload = slice.payload();
                    assert_eq!(payload.len(), 4 + (seq % 13) as usize);
                    assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), seq);
                    assert!(payload[4..].iter().all(|&b| b == seq as u8));
                    consumer.release(slice.offset());
                }
                (consumer.wheel().is_empty(), consumer.take_signal_error())
            });

            assert!(producing.join().unwrap().is_none());
            let (empty, signal_error) = consuming.join().unwrap();
            assert!(empty, "everything released but the wheel is not empty");
            assert!(signal_error.is_none());
        });
    }

    #[test]
    fn from_fds_shares_descriptor_state() {
        let region = TestRegion::new(1024);
        let producer = notified_wheel(&region, 1024);

        let readable = producer.readable_fd().try_clone_to_owned().unwrap();
        let writable = producer.writable_fd().try_clone_to_owned().unwrap();
        // SAFETY: region stays mapped and initialized for the test.
        let consumer_view = unsafe { Wheel::attach(region.as_mut_ptr()) };
        let consumer = NotifiedWheel::from_fds(consumer_view, readable, writable);

        producer.commit(producer.alloc(3).unwrap().offset());
        assert!(is_pollin(consumer.readable_fd()));

        let shared = consumer.peek().unwrap();
        let offset = shared.offset();
        consumer.release(offset);
        assert!(consumer.peek().is_none());
        assert!(!is_pollin(producer.readable_fd()));
    }
}
