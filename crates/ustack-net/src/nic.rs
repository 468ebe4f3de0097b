//! NIC collaborator interface
//!
//! The device driver (DMA, interrupts, descriptor rings) lives outside
//! this core; the stack only hands it wire-ready frame chains. The
//! [`LoopbackNic`] test double captures transmitted chains so tests and
//! single-process demos can feed them back into the receive path.

use crate::mem::MemoryProvider;
use crate::pbuf::Pbuf;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;
use ustack_common::{PoolId, StackResult};

/// Transmit interface to a NIC.
///
/// Each element of `chains` is the head of a scatter-gather pbuf chain
/// forming one wire frame. Ownership of the chains passes to the NIC on
/// success; the NIC (or whoever drains it) frees them.
pub trait Nic: Send + Sync {
    /// Queue frames for transmission. Returns the number accepted.
    fn send_packets(
        &self,
        chains: &[NonNull<Pbuf>],
        device: u32,
        queue: u32,
    ) -> StackResult<usize>;

    /// Opaque driver handle for a device, for collaborators that need to
    /// reach past this interface.
    fn driver_handle(&self, device: u32) -> u64;
}

/// Test/demo NIC: transmitted chains pile up in a queue for the test to
/// drain (typically to feed back into `NetStack::rx_frame`).
pub struct LoopbackNic {
    txq: Mutex<VecDeque<NonNull<Pbuf>>>,
}

unsafe impl Send for LoopbackNic {}
unsafe impl Sync for LoopbackNic {}

impl Default for LoopbackNic {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNic {
    pub fn new() -> Self {
        Self {
            txq: Mutex::new(VecDeque::new()),
        }
    }

    /// Take the oldest transmitted frame chain, if any.
    pub fn pop_tx(&self) -> Option<NonNull<Pbuf>> {
        self.txq.lock().pop_front()
    }

    /// Frames currently queued.
    pub fn tx_pending(&self) -> usize {
        self.txq.lock().len()
    }

    /// Take the oldest transmitted chain, linearized into one contiguous
    /// receive-style buffer (`hdr_len` 0, `payload_len` = frame length) the
    /// way the wire would present it back. Frees the transmit chain.
    pub fn pop_tx_frame(&self, mem: &dyn MemoryProvider) -> Option<NonNull<Pbuf>> {
        let chain = self.pop_tx()?;
        let mut frame = Pbuf::alloc(mem, PoolId::PacketBuf, 0, 0);
        unsafe {
            let fb = frame.as_mut();
            let mut len = 0usize;
            let mut cur = Some(chain);
            while let Some(p) = cur {
                let pb = p.as_ref();
                let b = pb.bytes();
                fb.bytes_mut()[len..len + b.len()].copy_from_slice(b);
                len += b.len();
                cur = pb.next;
            }
            fb.payload_len = len as u32;
            Pbuf::free_chain(chain, mem, 0);
        }
        Some(frame)
    }
}

impl Nic for LoopbackNic {
    fn send_packets(
        &self,
        chains: &[NonNull<Pbuf>],
        _device: u32,
        _queue: u32,
    ) -> StackResult<usize> {
        let mut q = self.txq.lock();
        q.extend(chains.iter().copied());
        Ok(chains.len())
    }

    fn driver_handle(&self, device: u32) -> u64 {
        device as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapPools;
    use ustack_common::PoolId;

    #[test]
    fn test_loopback_captures_in_order() {
        let mem = HeapPools::new(8);
        let nic = LoopbackNic::new();

        let a = Pbuf::alloc(&mem, PoolId::PacketBuf, 0, 0);
        let b = Pbuf::alloc(&mem, PoolId::PacketBuf, 0, 0);
        assert_eq!(nic.send_packets(&[a, b], 0, 0).unwrap(), 2);
        assert_eq!(nic.tx_pending(), 2);

        assert_eq!(nic.pop_tx(), Some(a));
        assert_eq!(nic.pop_tx(), Some(b));
        assert_eq!(nic.pop_tx(), None);

        unsafe {
            Pbuf::free_chain(a, &mem, 0);
            Pbuf::free_chain(b, &mem, 0);
        }
    }
}
