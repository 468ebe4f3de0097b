//! Lock-free ring implementations
//!
//! Both rings store opaque nonzero `u64` item handles in a power-of-two
//! slot array and wrap indices with a mask. Neither blocks; status codes
//! tell the caller exactly why an operation did not complete.
//!
//! Memory ordering is load-bearing here: a producer's payload store must be
//! published by a `Release` store of the index that makes the slot visible,
//! and consumers must `Acquire`-load that index before touching the slot.
//! Do not reorder these operations.

use crossbeam::utils::CachePadded;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::hint::spin_loop;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Reserved per-slot sentinel meaning "no item"
pub const EMPTY_SLOT: u64 = 0;

/// Ring operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// No unconsumed items
    #[error("ring empty")]
    Empty,

    /// No free slots
    #[error("ring full")]
    Full,

    /// Lost a consumer race; retry
    #[error("ring contention, retry")]
    Contention,

    /// Zero handle (reserved as the empty sentinel)
    #[error("invalid item handle")]
    InvalidParam,
}

/// Common contract for both ring variants.
///
/// `produce` inserts a nonzero handle; `consume` removes the oldest
/// unconsumed handle, delivering each item to exactly one consumer.
pub trait Ring: Send + Sync {
    /// Insert an item handle. `item` must be nonzero.
    fn produce(&self, item: u64) -> Result<(), RingError>;

    /// Remove the oldest unconsumed item handle.
    fn consume(&self) -> Result<u64, RingError>;

    /// Slot count (power of two)
    fn capacity(&self) -> u32;

    /// Approximate number of unconsumed items
    fn len(&self) -> u32;

    /// Approximate emptiness
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SlotRing: one CAS per consume, single producer by contract
// ============================================================================

/// Slot-at-a-time ring (variant a).
///
/// Consumers race on the oldest slot with a compare-and-swap against the
/// [`EMPTY_SLOT`] sentinel; exactly one wins, losers get
/// [`RingError::Contention`] and retry.
///
/// The producer path advances `head` with a plain load/store pair, not an
/// atomic RMW, and is therefore **single-producer by contract**: callers
/// must serialize producers externally. This is deliberate and documented
/// rather than silently half-safe; use [`StridedRing`] when multiple
/// producers are required.
pub struct SlotRing {
    capacity: u32,
    mask: u32,
    /// Producer index. Plain-store advanced; see the single-producer note.
    head: CachePadded<AtomicU32>,
    /// Consumer index. Advanced with fetch_add by the winning consumer.
    tail: CachePadded<AtomicU32>,
    slots: Box<[AtomicU64]>,
}

impl SlotRing {
    /// Create a ring with `capacity` slots. `capacity` must be a nonzero
    /// power of two.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity).map(|_| AtomicU64::new(EMPTY_SLOT)).collect();
        Self {
            capacity,
            mask: capacity - 1,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            slots,
        }
    }
}

impl Ring for SlotRing {
    fn produce(&self, item: u64) -> Result<(), RingError> {
        if item == EMPTY_SLOT {
            return Err(RingError::InvalidParam);
        }

        let h = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(h & self.mask) as usize];

        // The oldest lap of this slot has not been consumed yet.
        if slot.load(Ordering::Acquire) != EMPTY_SLOT {
            return Err(RingError::Full);
        }

        // Publish payload, then the index. Release on both: the slot store
        // makes the item visible to consumers that race ahead of the head
        // advance, the head store publishes it to consumers checking head.
        slot.store(item, Ordering::Release);
        self.head.store(h.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn consume(&self) -> Result<u64, RingError> {
        let t = self.tail.load(Ordering::Acquire);
        let slot = &self.slots[(t & self.mask) as usize];

        let v = slot.load(Ordering::Acquire);
        if v == EMPTY_SLOT {
            // Either genuinely empty, or a racing consumer emptied this
            // slot between our tail load and slot load.
            return if self.head.load(Ordering::Acquire) == t {
                Err(RingError::Empty)
            } else {
                Err(RingError::Contention)
            };
        }

        // Exactly one consumer wins the slot.
        match slot.compare_exchange(v, EMPTY_SLOT, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                self.tail.fetch_add(1, Ordering::AcqRel);
                Ok(v)
            }
            Err(_) => Err(RingError::Contention),
        }
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn len(&self) -> u32 {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }
}

// ============================================================================
// StridedRing: reserve/publish/close with separate head and tail counters
// ============================================================================

/// Batched multi-producer multi-consumer ring (variant b).
///
/// Producers CAS-reserve a slot at `prod_head`, write the payload, then
/// close the reservation: spin until `prod_tail` reaches their own index
/// (any earlier concurrent reservation has closed) and advance it with a
/// `Release` store. Consumers mirror the protocol on `cons_head`/`cons_tail`
/// against the published `prod_tail`.
///
/// The header is `#[repr(C)]` with the slot array at a fixed offset
/// immediately after it, so a ring can be placement-constructed inside a
/// shared-memory segment by one process and re-attached by another without
/// re-initialization.
#[repr(C)]
pub struct StridedRing {
    capacity: u32,
    mask: u32,
    prod_head: CachePadded<AtomicU32>,
    prod_tail: CachePadded<AtomicU32>,
    cons_head: CachePadded<AtomicU32>,
    cons_tail: CachePadded<AtomicU32>,
    // `capacity` AtomicU64 slots follow the header.
}

impl StridedRing {
    /// Bytes required for a ring with `capacity` slots, header included.
    pub const fn bytes_for(capacity: u32) -> usize {
        mem::size_of::<StridedRing>() + capacity as usize * mem::size_of::<AtomicU64>()
    }

    /// Placement-construct a ring in zeroed memory.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least [`bytes_for`](Self::bytes_for)`(capacity)`
    /// bytes, aligned for `StridedRing`, not in use by anything else, and
    /// must outlive every handle derived from the returned pointer.
    /// `capacity` must be a nonzero power of two.
    pub unsafe fn init_at(mem: NonNull<u8>, capacity: u32) -> NonNull<StridedRing> {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        debug_assert_eq!(mem.as_ptr() as usize % mem::align_of::<StridedRing>(), 0);

        let ring = mem.as_ptr() as *mut StridedRing;
        // Counters to zero, every slot to the empty sentinel.
        std::ptr::write_bytes(mem.as_ptr(), 0, Self::bytes_for(capacity));
        (*ring).capacity = capacity;
        (*ring).mask = capacity - 1;
        NonNull::new_unchecked(ring)
    }

    /// Reinterpret an already-constructed ring (shared-memory attach path).
    ///
    /// # Safety
    ///
    /// `mem` must point to memory previously initialized by
    /// [`init_at`](Self::init_at) and still mapped for the lifetime of the
    /// returned pointer.
    pub unsafe fn attach(mem: NonNull<u8>) -> NonNull<StridedRing> {
        let ring = mem.as_ptr() as *mut StridedRing;
        debug_assert!((*ring).capacity.is_power_of_two());
        NonNull::new_unchecked(ring)
    }

    #[inline(always)]
    fn slots(&self) -> &[AtomicU64] {
        // Slot array sits immediately after the header; both live inside
        // the single allocation handed to init_at.
        unsafe {
            let base = (self as *const StridedRing).add(1) as *const AtomicU64;
            std::slice::from_raw_parts(base, self.capacity as usize)
        }
    }
}

impl Ring for StridedRing {
    fn produce(&self, item: u64) -> Result<(), RingError> {
        if item == EMPTY_SLOT {
            return Err(RingError::InvalidParam);
        }

        // Reserve a slot.
        let h = loop {
            let h = self.prod_head.load(Ordering::Relaxed);
            let ct = self.cons_tail.load(Ordering::Acquire);
            if h.wrapping_sub(ct) >= self.capacity {
                return Err(RingError::Full);
            }
            if self
                .prod_head
                .compare_exchange_weak(h, h.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break h;
            }
        };

        self.slots()[(h & self.mask) as usize].store(item, Ordering::Relaxed);

        // Close the reservation in order: earlier reservations close first.
        while self.prod_tail.load(Ordering::Relaxed) != h {
            spin_loop();
        }
        self.prod_tail.store(h.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn consume(&self) -> Result<u64, RingError> {
        let h = loop {
            let h = self.cons_head.load(Ordering::Relaxed);
            let pt = self.prod_tail.load(Ordering::Acquire);
            if h == pt {
                return Err(RingError::Empty);
            }
            if self
                .cons_head
                .compare_exchange_weak(h, h.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break h;
            }
        };

        let v = self.slots()[(h & self.mask) as usize].load(Ordering::Relaxed);

        while self.cons_tail.load(Ordering::Relaxed) != h {
            spin_loop();
        }
        self.cons_tail.store(h.wrapping_add(1), Ordering::Release);
        Ok(v)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn len(&self) -> u32 {
        self.prod_tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons_tail.load(Ordering::Acquire))
    }
}

/// Heap-owned [`StridedRing`] for single-process use (workers, tests,
/// benches). Shared-memory rings are owned by their segment instead.
pub struct OwnedStridedRing {
    ring: NonNull<StridedRing>,
    layout: Layout,
}

unsafe impl Send for OwnedStridedRing {}
unsafe impl Sync for OwnedStridedRing {}

impl OwnedStridedRing {
    /// Allocate and initialize a ring with `capacity` slots.
    pub fn new(capacity: u32) -> Self {
        let layout = Layout::from_size_align(
            StridedRing::bytes_for(capacity),
            mem::align_of::<StridedRing>(),
        )
        .expect("ring layout");
        let mem = unsafe { alloc_zeroed(layout) };
        let mem = NonNull::new(mem).expect("ring allocation failed");
        let ring = unsafe { StridedRing::init_at(mem, capacity) };
        Self { ring, layout }
    }
}

impl Deref for OwnedStridedRing {
    type Target = StridedRing;

    fn deref(&self) -> &StridedRing {
        unsafe { self.ring.as_ref() }
    }
}

impl Drop for OwnedStridedRing {
    fn drop(&mut self) {
        unsafe { dealloc(self.ring.as_ptr() as *mut u8, self.layout) }
    }
}

impl Ring for OwnedStridedRing {
    fn produce(&self, item: u64) -> Result<(), RingError> {
        (**self).produce(item)
    }

    fn consume(&self) -> Result<u64, RingError> {
        (**self).consume()
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn len(&self) -> u32 {
        (**self).len()
    }
}
