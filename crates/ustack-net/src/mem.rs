//! Memory collaborator interface
//!
//! The stack never allocates on the hot path; it draws fixed-size buffers
//! from named pools through this interface and frees them back exactly
//! once. The real allocator (slab/span + virtual address allocator) lives
//! outside this core; [`HeapPools`] is the in-process implementation used
//! by tests and single-process deployments.
//!
//! Pool exhaustion is fatal by design: continuing with a null buffer would
//! corrupt protocol state, so the process aborts.

use crossbeam::queue::ArrayQueue;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use ustack_common::{PhysAddr, PoolId};

/// Cache line size for pool element alignment
pub const CACHE_LINE: usize = 64;

/// Fixed element size per pool, in bytes.
pub const fn elem_size(pool: PoolId) -> usize {
    match pool {
        PoolId::Descriptor => 64,
        // Holds a full wire frame or an application payload spanning
        // several fragments.
        PoolId::PacketBuf => 4096,
        PoolId::MbufMeta => 128,
        PoolId::Reassembly => 2048,
        PoolId::NetHeader => 128,
        PoolId::UdpControl => 64,
    }
}

/// Allocation interface supplying virtual/physical address pairs for named
/// pools. `device` and `core` select NUMA-local backing where the provider
/// supports it.
pub trait MemoryProvider: Send + Sync {
    /// Allocate one element from `pool`. Aborts the process on exhaustion.
    fn alloc(&self, pool: PoolId, device: u32, core: u32) -> NonNull<u8>;

    /// Return `ptr` to `pool`. Must be called exactly once per allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `alloc` on the same pool and must not be
    /// used after this call.
    unsafe fn free(&self, ptr: NonNull<u8>, pool: PoolId, device: u32);

    /// DMA address for a pool element.
    fn physical_address(&self, ptr: NonNull<u8>, pool: PoolId, device: u32) -> PhysAddr;
}

/// One preallocated fixed-size pool with a lock-free free list. The queue
/// hands each element index to exactly one owner at a time, so concurrent
/// alloc/free from workers and the receive path never alias a buffer.
struct Pool {
    base: NonNull<u8>,
    elem: usize,
    count: usize,
    layout: Layout,
    /// Free element indices.
    free: ArrayQueue<u32>,
    /// Simulated IOVA base for this pool.
    phys_base: u64,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    fn new(pool: PoolId, count: usize) -> Self {
        let elem = elem_size(pool);
        let layout = Layout::from_size_align(elem * count, CACHE_LINE).expect("pool layout");
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("pool allocation failed");

        let free = ArrayQueue::new(count);
        for i in 0..count as u32 {
            // Queue capacity equals count, so the push cannot fail.
            let _ = free.push(i);
        }

        Self {
            base,
            elem,
            count,
            layout,
            free,
            // Disjoint fake IOVA ranges per pool so a physical address
            // identifies its pool in diagnostics.
            phys_base: (pool as u64 + 1) << 32,
        }
    }

    fn alloc(&self) -> Option<NonNull<u8>> {
        let idx = self.free.pop()? as usize;
        NonNull::new(unsafe { self.base.as_ptr().add(idx * self.elem) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let off = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert_eq!(off % self.elem, 0, "freed pointer not on element boundary");
        let pushed = self.free.push((off / self.elem) as u32);
        debug_assert!(pushed.is_ok(), "double free into pool");
    }

    fn phys(&self, ptr: NonNull<u8>) -> PhysAddr {
        let off = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        PhysAddr(self.phys_base + off as u64)
    }

    fn available(&self) -> usize {
        self.free.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Heap-backed implementation of [`MemoryProvider`]: one preallocated
/// free-list pool per [`PoolId`], no allocation after construction.
pub struct HeapPools {
    pools: [Pool; 6],
}

impl HeapPools {
    /// Preallocate `count` elements in every pool.
    pub fn new(count: usize) -> Self {
        let pools = PoolId::ALL.map(|p| Pool::new(p, count));
        Self { pools }
    }

    /// Free elements remaining in `pool`.
    pub fn available(&self, pool: PoolId) -> usize {
        self.pools[pool as usize].available()
    }
}

impl MemoryProvider for HeapPools {
    fn alloc(&self, pool: PoolId, _device: u32, _core: u32) -> NonNull<u8> {
        match self.pools[pool as usize].alloc() {
            Some(ptr) => ptr,
            None => {
                // A null buffer would corrupt protocol state downstream;
                // exhaustion is fatal.
                tracing::error!(?pool, "buffer pool exhausted, aborting");
                std::process::abort();
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, pool: PoolId, _device: u32) {
        self.pools[pool as usize].free(ptr)
    }

    fn physical_address(&self, ptr: NonNull<u8>, pool: PoolId, _device: u32) -> PhysAddr {
        self.pools[pool as usize].phys(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_cycle() {
        let pools = HeapPools::new(16);
        assert_eq!(pools.available(PoolId::PacketBuf), 16);

        let a = pools.alloc(PoolId::PacketBuf, 0, 0);
        let b = pools.alloc(PoolId::PacketBuf, 0, 0);
        assert_ne!(a, b);
        assert_eq!(pools.available(PoolId::PacketBuf), 14);

        unsafe {
            pools.free(a, PoolId::PacketBuf, 0);
            pools.free(b, PoolId::PacketBuf, 0);
        }
        assert_eq!(pools.available(PoolId::PacketBuf), 16);
    }

    #[test]
    fn test_concurrent_alloc_free_keeps_buffers_exclusive() {
        use std::sync::Arc;

        // Two elements, four threads: heavy contention on the free list.
        // Each owner stamps its buffer and re-reads it; a stale index
        // handed to two threads at once shows up as a foreign stamp.
        let pool = Arc::new(Pool::new(PoolId::UdpControl, 2));
        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        let ptr = loop {
                            if let Some(p) = pool.alloc() {
                                break p;
                            }
                            std::hint::spin_loop();
                        };
                        let buf = unsafe {
                            std::slice::from_raw_parts_mut(ptr.as_ptr(), elem_size(PoolId::UdpControl))
                        };
                        buf.fill(t);
                        std::hint::spin_loop();
                        assert!(buf.iter().all(|&b| b == t), "buffer handed to two owners");
                        unsafe { pool.free(ptr) };
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pools_are_independent() {
        let pools = HeapPools::new(4);
        let _hdr = pools.alloc(PoolId::NetHeader, 0, 0);
        assert_eq!(pools.available(PoolId::NetHeader), 3);
        assert_eq!(pools.available(PoolId::PacketBuf), 4);
    }

    #[test]
    fn test_physical_addresses_disjoint_per_pool() {
        let pools = HeapPools::new(4);
        let a = pools.alloc(PoolId::PacketBuf, 0, 0);
        let b = pools.alloc(PoolId::NetHeader, 0, 0);

        let pa = pools.physical_address(a, PoolId::PacketBuf, 0);
        let pb = pools.physical_address(b, PoolId::NetHeader, 0);
        assert_ne!(pa.as_u64() >> 32, pb.as_u64() >> 32);
    }

    #[test]
    fn test_elements_zeroed_and_cacheline_aligned() {
        let pools = HeapPools::new(4);
        let p = pools.alloc(PoolId::PacketBuf, 0, 0);
        assert_eq!(p.as_ptr() as usize % CACHE_LINE, 0);
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), elem_size(PoolId::PacketBuf)) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
