//! Packet buffer descriptors
//!
//! A `Pbuf` references raw frame bytes plus fragment-chain linkage. The
//! descriptor itself comes from the `MbufMeta` pool; the bytes it points at
//! come from whichever data pool the caller named (or, for scatter-gather
//! payload views, from another segment entirely, in which case the view
//! does not own the bytes).
//!
//! Ownership is linear: whichever stage holds a pbuf (receive path,
//! reassembly record, ring slot, transmit chain) frees it exactly once on
//! every exit path.

use crate::mem::{elem_size, MemoryProvider};
use std::ptr::NonNull;
use ustack_common::PoolId;

/// Packet buffer descriptor.
#[repr(C)]
pub struct Pbuf {
    /// Virtual pointer to the frame bytes.
    pub data: NonNull<u8>,
    /// Capacity of the data buffer in bytes.
    pub data_cap: u32,
    /// Bytes of headers at the front of `data` (Eth+IP[+UDP]).
    pub hdr_len: u32,
    /// Bytes of IP payload in this segment (after the headers).
    pub payload_len: u32,
    /// Next fragment in the chain.
    pub next: Option<NonNull<Pbuf>>,
    /// Total fragments in the chain (meaningful on the chain head).
    pub frag_count: u32,
    /// Reassembly annotation: payload start offset within the datagram.
    pub frag_start: u16,
    /// Reassembly annotation: payload end offset within the datagram.
    pub frag_end: u16,
    /// Pool the data bytes came from.
    pub data_pool: PoolId,
    /// Whether this descriptor owns (and must free) the data bytes.
    pub owns_data: bool,
}

impl Pbuf {
    /// Allocate a descriptor plus an owned data buffer from `data_pool`.
    pub fn alloc(mem: &dyn MemoryProvider, data_pool: PoolId, device: u32, core: u32) -> NonNull<Pbuf> {
        let data = mem.alloc(data_pool, device, core);
        let meta = mem.alloc(PoolId::MbufMeta, device, core);

        let pbuf = meta.cast::<Pbuf>();
        unsafe {
            pbuf.as_ptr().write(Pbuf {
                data,
                data_cap: elem_size(data_pool) as u32,
                hdr_len: 0,
                payload_len: 0,
                next: None,
                frag_count: 1,
                frag_start: 0,
                frag_end: 0,
                data_pool,
                owns_data: true,
            });
        }
        pbuf
    }

    /// Allocate a descriptor viewing `len` bytes at `data` without taking
    /// ownership. Used for scatter-gather payload segments.
    pub fn alloc_view(
        mem: &dyn MemoryProvider,
        data: NonNull<u8>,
        len: u32,
        device: u32,
        core: u32,
    ) -> NonNull<Pbuf> {
        let meta = mem.alloc(PoolId::MbufMeta, device, core);
        let pbuf = meta.cast::<Pbuf>();
        unsafe {
            pbuf.as_ptr().write(Pbuf {
                data,
                data_cap: len,
                hdr_len: 0,
                payload_len: len,
                next: None,
                frag_count: 1,
                frag_start: 0,
                frag_end: 0,
                data_pool: PoolId::PacketBuf,
                owns_data: false,
            });
        }
        pbuf
    }

    /// Frame bytes (headers + payload).
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        let len = (self.hdr_len + self.payload_len) as usize;
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), len) }
    }

    /// Mutable frame bytes up to the buffer capacity.
    #[inline(always)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.data_cap as usize) }
    }

    /// Payload bytes (after the headers).
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().add(self.hdr_len as usize),
                self.payload_len as usize,
            )
        }
    }

    /// Total frame length of this segment.
    #[inline(always)]
    pub fn len(&self) -> usize {
        (self.hdr_len + self.payload_len) as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of payload bytes across the whole chain.
    pub fn chain_payload_len(head: NonNull<Pbuf>) -> usize {
        let mut total = 0;
        let mut cur = Some(head);
        while let Some(p) = cur {
            let p = unsafe { p.as_ref() };
            total += p.payload_len as usize;
            cur = p.next;
        }
        total
    }

    /// Copy the chain's payload bytes into a vector, in chain order.
    /// Test/diagnostic helper; the hot path never linearizes.
    pub fn chain_payload_to_vec(head: NonNull<Pbuf>) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::chain_payload_len(head));
        let mut cur = Some(head);
        while let Some(p) = cur {
            let p = unsafe { p.as_ref() };
            out.extend_from_slice(p.payload());
            cur = p.next;
        }
        out
    }

    /// Free a whole chain: each segment's data (if owned) and descriptor
    /// go back to their pools exactly once.
    ///
    /// # Safety
    ///
    /// `head` and every segment linked from it must be live allocations
    /// from `mem`, and no segment may be referenced after this call.
    pub unsafe fn free_chain(head: NonNull<Pbuf>, mem: &dyn MemoryProvider, device: u32) {
        let mut cur = Some(head);
        while let Some(p) = cur {
            let pb = p.as_ref();
            cur = pb.next;
            if pb.owns_data {
                mem.free(pb.data, pb.data_pool, device);
            }
            mem.free(p.cast::<u8>(), PoolId::MbufMeta, device);
        }
    }
}

/// Ring-slot encoding of a pbuf pointer. Nonzero by construction, so it
/// never collides with the ring's empty sentinel.
#[inline(always)]
pub fn into_handle(p: NonNull<Pbuf>) -> u64 {
    p.as_ptr() as u64
}

/// Decode a ring-slot handle back into a pbuf pointer.
///
/// # Safety
///
/// `handle` must have come from [`into_handle`] on a still-live pbuf in
/// this address space.
#[inline(always)]
pub unsafe fn from_handle(handle: u64) -> NonNull<Pbuf> {
    NonNull::new_unchecked(handle as *mut Pbuf)
}
