//! carousel: a lock-free SPSC queue of variable-sized byte slices in a
//! fixed-size shared-memory region.
//!
//! Two cooperating processes — with disjoint address spaces and disjoint
//! file-descriptor tables — exchange messages at memory-copy speed. All
//! queue state lives inside the shared region, addressed by 32-bit offsets
//! instead of pointers, and is coordinated exclusively through atomics at
//! well-known offsets.
//!
//! # Roles
//!
//! Exactly one *producer* allocates and commits slices; exactly one
//! *consumer* peeks and releases them, in FIFO order:
//!
//! ```ignore
//! // Producer process: initialize inside a shared mapping.
//! let wheel = unsafe { Wheel::init(region.as_ptr(), region.len())? };
//! let mut slice = wheel.alloc(payload.len()).expect("wheel full");
//! slice.payload_mut().copy_from_slice(&payload);
//! wheel.commit(slice.offset());
//!
//! // Consumer process: attach to the same mapping.
//! let wheel = unsafe { Wheel::attach(region.as_ptr()) };
//! if let Some(slice) = wheel.peek() {
//!     handle(slice.payload());
//!     wheel.release(slice.offset());
//! }
//! ```
//!
//! No operation blocks; both sides get `None` and pick their own waiting
//! discipline. For event-loop integration, [`NotifiedWheel`] layers two
//! counting-semaphore eventfds over the same four operations so a reactor
//! can wait for "something to read" or "room to write".
//!
//! # Crash safety
//!
//! None. A peer dying mid-operation can leave the wheel wedged; tear the
//! region down and start over. The wheel targets trusted process pairs.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod layout;
mod notify;
mod wheel;

pub use layout::{aligned_units, LayoutError, SliceState, WheelOffset, ALIGN, INVALID_OFFSET};
pub use notify::NotifiedWheel;
pub use wheel::{AllocatedSlice, SharedSlice, SliceStatus, Wheel, WheelStatus};
