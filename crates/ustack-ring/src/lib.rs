//! Lock-Free Rings and Shared-Memory Channels
//!
//! The only cross-thread (and cross-process) mutable state in the data
//! plane. A ring is a fixed-capacity, power-of-two-sized array of
//! pointer-sized item handles with monotonically increasing indices; a
//! channel pairs two rings inside shared memory to form a bidirectional
//! transport between a creator and an attacher endpoint.
//!
//! # Design
//!
//! - No mutexes anywhere: discipline is enforced entirely through the
//!   lock-free protocol (CAS + acquire/release publication).
//! - No blocking: callers that need to wait spin with
//!   [`std::hint::spin_loop`], checking their stop token each iteration.
//! - Handles are opaque `u64` values; `0` is the reserved empty sentinel
//!   and is rejected as `InvalidParam`.
//!
//! Two interchangeable ring implementations are provided:
//!
//! | Ring | Producers | Consumers | Placement |
//! |------|-----------|-----------|-----------|
//! | [`SlotRing`] | single (by contract) | multi, CAS per slot | heap |
//! | [`StridedRing`] | multi, CAS reservation | multi | heap or shared memory |

pub mod channel;
pub mod ring;
pub mod shm;

pub use channel::{Channel, Role};
pub use ring::{OwnedStridedRing, Ring, RingError, SlotRing, StridedRing};
pub use shm::SharedSegment;
