//! carousel-shm: the OS plumbing around a carousel wheel.
//!
//! The wheel itself only sees a mapped byte region and, optionally, a pair
//! of eventfds. This crate supplies both sides of that bargain for the
//! common Linux setup:
//!
//! - [`SharedRegion`]: an anonymous `memfd` mapped shared, created in one
//!   process and re-mapped in another from the passed descriptor.
//! - [`scm`]: `SCM_RIGHTS` ancillary transfer of descriptors (the memfd and
//!   the notification eventfds) over a Unix socket.
//!
//! ```ignore
//! // Creating side
//! let region = SharedRegion::create("wheel", 128 * 1024)?;
//! scm::send_fds_with_data(sock.as_fd(), &[region.memfd().as_raw_fd()], &handshake)?;
//!
//! // Receiving side
//! let (mut fds, _n) = scm::recv_fds_with_data(sock.as_fd(), &mut handshake)?;
//! let region = SharedRegion::from_fd(fds.remove(0), len)?;
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod region;
pub mod scm;

pub use region::SharedRegion;
