//! Shared-memory channels
//!
//! A channel is two [`StridedRing`]s, each in its own shared-memory
//! segment, presenting a symmetric bidirectional queue between a creator
//! and an attacher endpoint. The creator produces into ring 0 and consumes
//! ring 1; the attacher is the mirror, so each endpoint always writes the
//! ring its peer reads.

use crate::ring::{Ring, RingError, StridedRing};
use crate::shm::SharedSegment;
use std::ptr::NonNull;
use ustack_common::StackResult;

/// Which end of the channel this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocated and initialized both segments.
    Creator,
    /// Mapped pre-existing segments; reinterpreted the ring headers.
    Attacher,
}

/// Bidirectional cross-thread/cross-process transport.
pub struct Channel {
    index: usize,
    role: Role,
    numa_node: usize,
    // Segments own the mappings the ring pointers live in; field order
    // keeps them alive for the lifetime of the handles above.
    tx: NonNull<StridedRing>,
    rx: NonNull<StridedRing>,
    _seg0: SharedSegment,
    _seg1: SharedSegment,
}

unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

fn segment_name(index: usize, ring: usize) -> String {
    format!("/ustack-ch{index}-r{ring}")
}

impl Channel {
    /// Create channel `index`: allocate both segments and
    /// placement-construct a ring in each.
    ///
    /// NUMA placement is first-touch; call from a thread pinned to a core
    /// on `numa_node`. The node index is recorded for diagnostics only.
    pub fn create(index: usize, capacity: u32, numa_node: usize) -> StackResult<Self> {
        let len = StridedRing::bytes_for(capacity);
        let seg0 = SharedSegment::create(&segment_name(index, 0), len)?;
        let seg1 = SharedSegment::create(&segment_name(index, 1), len)?;

        let r0 = unsafe { StridedRing::init_at(seg0.as_ptr(), capacity) };
        let r1 = unsafe { StridedRing::init_at(seg1.as_ptr(), capacity) };

        tracing::info!(index, capacity, numa_node, "channel created");

        Ok(Self {
            index,
            role: Role::Creator,
            numa_node,
            tx: r0,
            rx: r1,
            _seg0: seg0,
            _seg1: seg1,
        })
    }

    /// Attach to channel `index` created by a peer. The pre-existing ring
    /// headers are reinterpreted, never re-initialized.
    pub fn attach(index: usize, capacity: u32) -> StackResult<Self> {
        let len = StridedRing::bytes_for(capacity);
        let seg0 = SharedSegment::attach(&segment_name(index, 0), len)?;
        let seg1 = SharedSegment::attach(&segment_name(index, 1), len)?;

        let r0 = unsafe { StridedRing::attach(seg0.as_ptr()) };
        let r1 = unsafe { StridedRing::attach(seg1.as_ptr()) };

        tracing::info!(index, capacity, "channel attached");

        // Mirror of the creator: write what the peer reads.
        Ok(Self {
            index,
            role: Role::Attacher,
            numa_node: 0,
            tx: r1,
            rx: r0,
            _seg0: seg0,
            _seg1: seg1,
        })
    }

    /// Insert an item into the peer-facing ring.
    #[inline]
    pub fn produce(&self, item: u64) -> Result<(), RingError> {
        unsafe { self.tx.as_ref() }.produce(item)
    }

    /// Remove the oldest item the peer produced.
    #[inline]
    pub fn consume(&self) -> Result<u64, RingError> {
        unsafe { self.rx.as_ref() }.consume()
    }

    /// Unconsumed items waiting for this endpoint.
    pub fn pending(&self) -> u32 {
        unsafe { self.rx.as_ref() }.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }
}
