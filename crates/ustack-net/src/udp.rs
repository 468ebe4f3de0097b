//! UDP input/output
//!
//! Output is zero-copy scatter-gather: each IP fragment is a NetHeader-pool
//! buffer holding Eth+IP (+UDP on the first fragment) chained to a view of
//! the application payload. The payload bytes are never copied; the views
//! alias them until the NIC has drained the frames, so the payload buffer
//! itself rides the last fragment's chain as a zero-length tail segment
//! and is freed with that chain.
//!
//! The IP identification value is monotonically increasing and partitioned
//! per transmit queue, so queues never share an identifier range.

use crate::mem::MemoryProvider;
use crate::pbuf::Pbuf;
use crate::wire::{
    EthHeader, Ipv4Header, UdpHeader, ETHERTYPE_IPV4, ETH_HDR_LEN, FRAG_UNIT, IP_FLAG_MF,
    IP_HDR_LEN, IP_PROTO_UDP, UDP_HDR_LEN,
};
use std::net::Ipv4Addr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use ustack_common::{MacAddr, PoolId};

/// What the message processor wants done with a delivered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Release the buffer chain back to its pools now.
    Release,
    /// The sink queued the chain elsewhere (e.g. pushed to a ring); the
    /// stack must not free it.
    Retained,
}

/// Addressing for a delivered datagram.
#[derive(Debug, Clone, Copy)]
pub struct DatagramMeta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// UDP payload bytes across the chain.
    pub len: usize,
}

/// External message processor receiving reassembled UDP payloads.
pub trait DatagramSink: Send + Sync {
    fn deliver(&self, payload: NonNull<Pbuf>, meta: DatagramMeta) -> Disposition;
}

/// Per-transmit-queue-partitioned IP identification source. Queue `q` draws
/// from `[q * range, (q + 1) * range)` and wraps within its own partition.
pub struct IpIdAllocator {
    /// Partition width; 0x10000 for a single queue, so it stays u32.
    range: u32,
    counters: Box<[AtomicU16]>,
}

impl IpIdAllocator {
    /// `num_queues` must be a power of two dividing the 16-bit space.
    pub fn new(num_queues: usize) -> Self {
        assert!(num_queues.is_power_of_two() && num_queues <= 0x10000);
        let range = 0x10000 / num_queues as u32;
        let counters = (0..num_queues).map(|_| AtomicU16::new(0)).collect();
        Self { range, counters }
    }

    /// Next identification value for `queue`.
    #[inline]
    pub fn next(&self, queue: usize) -> u16 {
        let n = self.counters[queue].fetch_add(1, Ordering::Relaxed);
        (queue as u32 * self.range + n as u32 % self.range) as u16
    }
}

/// Flow-distribution hash carried in the first fragment's UDP checksum
/// field (wire deviation, see the module docs). FNV-1a folded to 16 bits,
/// matching what this system's receivers key their queue choice on.
pub fn flow_hash(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> u16 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut h = FNV_OFFSET;
    for byte in src
        .octets()
        .iter()
        .chain(dst.octets().iter())
        .chain(src_port.to_be_bytes().iter())
        .chain(dst_port.to_be_bytes().iter())
    {
        h ^= *byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    (h ^ (h >> 16) ^ (h >> 32) ^ (h >> 48)) as u16
}

/// Addressing and placement parameters for one transmit call.
pub struct UdpTxParams {
    pub local_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub dst_mac: MacAddr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub mtu: usize,
    pub device: u32,
    pub core: u32,
    pub queue: u32,
}

/// Split an application payload into wire-ready frame chains.
///
/// `payload` must be a single contiguous segment whose `payload_len` bytes
/// start at `data`. Each returned chain is one frame: a header buffer
/// chained to a zero-copy view of the payload slice it carries. Ownership
/// of the chains passes to the caller (normally straight to the NIC), and
/// `payload` goes with them: it is appended to the last chain as a
/// zero-length tail segment, so whoever frees that chain frees it.
pub fn build_fragments(
    mem: &dyn MemoryProvider,
    params: &UdpTxParams,
    payload: NonNull<Pbuf>,
    ids: &IpIdAllocator,
) -> Vec<NonNull<Pbuf>> {
    let app = unsafe { payload.as_ref() };
    let app_len = app.payload_len as usize;
    let udp_total = UDP_HDR_LEN + app_len;

    // Per-fragment IP payload capacity, in whole fragment units.
    let frag_cap = (params.mtu - IP_HDR_LEN) & !(FRAG_UNIT - 1);
    let ident = ids.next(params.queue as usize);
    let fragmented = udp_total > frag_cap;

    let hash = flow_hash(params.local_ip, params.dst_ip, params.src_port, params.dst_port);

    let mut chains = Vec::with_capacity(udp_total.div_ceil(frag_cap));
    let mut udp_off = 0usize; // offset into the UDP datagram (header + data)

    while udp_off < udp_total {
        let frag_len = frag_cap.min(udp_total - udp_off);
        let last = udp_off + frag_len == udp_total;
        let first = udp_off == 0;

        let mut hdr = Pbuf::alloc(mem, PoolId::NetHeader, params.device, params.core);
        let hb = unsafe { hdr.as_mut() };
        let l2l3 = ETH_HDR_LEN + IP_HDR_LEN;
        hb.hdr_len = (l2l3 + if first { UDP_HDR_LEN } else { 0 }) as u32;

        let buf = hb.bytes_mut();
        EthHeader {
            dst: params.dst_mac,
            src: params.local_mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .write(buf);

        let mut flags_offset = (udp_off / FRAG_UNIT) as u16;
        if fragmented && !last {
            flags_offset |= IP_FLAG_MF;
        }
        Ipv4Header {
            tos: 0,
            total_len: (IP_HDR_LEN + frag_len) as u16,
            ident,
            flags_offset,
            ttl: 64,
            protocol: IP_PROTO_UDP,
            checksum: 0,
            src: params.local_ip,
            dst: params.dst_ip,
        }
        .write(&mut buf[ETH_HDR_LEN..]);

        // App-payload slice this fragment carries.
        let (app_start, app_end);
        if first {
            UdpHeader {
                src_port: params.src_port,
                dst_port: params.dst_port,
                length: udp_total as u16,
                // Flow hash, not a checksum: wire deviation preserved.
                checksum: hash,
            }
            .write(&mut buf[l2l3..]);
            app_start = 0;
            app_end = frag_len - UDP_HDR_LEN;
        } else {
            app_start = udp_off - UDP_HDR_LEN;
            app_end = app_start + frag_len;
        }

        // Zero-copy view into the application payload.
        let view_data = unsafe { NonNull::new_unchecked(app.data.as_ptr().add(app_start)) };
        let view = Pbuf::alloc_view(mem, view_data, (app_end - app_start) as u32, params.device, params.core);

        let hb = unsafe { hdr.as_mut() };
        hb.next = Some(view);
        hb.frag_count = 2;

        chains.push(hdr);
        udp_off += frag_len;
    }

    // Ownership of the payload transfers with the frames: park it behind
    // the last fragment's view, contributing no wire bytes.
    if let Some(&last) = chains.last() {
        let mut parked = payload;
        {
            let pb = unsafe { parked.as_mut() };
            pb.hdr_len = 0;
            pb.payload_len = 0;
            pb.next = None;
        }
        let mut tail = last;
        while let Some(n) = unsafe { tail.as_ref() }.next {
            tail = n;
        }
        unsafe { tail.as_mut() }.next = Some(parked);
        let mut head = last;
        unsafe { head.as_mut() }.frag_count = 3;
    }

    if let Some(first) = chains.first() {
        tracing::trace!(
            fragments = chains.len(),
            udp_total,
            ident,
            handle = first.as_ptr() as usize,
            "built udp transmit chains"
        );
    }

    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapPools;

    fn params(mtu: usize) -> UdpTxParams {
        UdpTxParams {
            local_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            local_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_mac: MacAddr([2, 0, 0, 0, 0, 2]),
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 5000,
            dst_port: 6000,
            mtu,
            device: 0,
            core: 0,
            queue: 0,
        }
    }

    fn payload_pbuf(mem: &HeapPools, len: usize) -> NonNull<Pbuf> {
        let mut p = Pbuf::alloc(mem, PoolId::PacketBuf, 0, 0);
        unsafe {
            let pb = p.as_mut();
            pb.payload_len = len as u32;
            for (i, b) in pb.bytes_mut()[..len].iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        p
    }

    fn free_all(mem: &HeapPools, chains: Vec<NonNull<Pbuf>>) {
        for c in chains {
            unsafe { Pbuf::free_chain(c, mem, 0) };
        }
    }

    #[test]
    fn test_small_payload_single_frame() {
        let mem = HeapPools::new(32);
        let ids = IpIdAllocator::new(1);
        let payload = payload_pbuf(&mem, 100);

        let chains = build_fragments(&mem, &params(1500), payload, &ids);
        assert_eq!(chains.len(), 1);

        let frame = Pbuf::chain_payload_to_vec(chains[0]);
        // Chain head payload is empty (headers only); the view carries it.
        assert_eq!(frame.len(), 100);

        let head = unsafe { chains[0].as_ref() };
        let ip = Ipv4Header::parse(&head.bytes()[ETH_HDR_LEN..]).unwrap();
        assert!(!ip.is_fragment());
        assert_eq!(ip.total_len as usize, IP_HDR_LEN + UDP_HDR_LEN + 100);

        let udp = UdpHeader::parse(&head.bytes()[ETH_HDR_LEN + IP_HDR_LEN..]).unwrap();
        assert_eq!(udp.length as usize, UDP_HDR_LEN + 100);

        free_all(&mem, chains);
    }

    #[test]
    fn test_payload_freed_with_last_chain() {
        let mem = HeapPools::new(32);
        let ids = IpIdAllocator::new(1);
        let payload = payload_pbuf(&mem, 3000);

        let chains = build_fragments(&mem, &params(1500), payload, &ids);

        // The payload buffer rides the last chain's tail and contributes
        // no wire bytes of its own.
        let mut tail = *chains.last().unwrap();
        while let Some(n) = unsafe { tail.as_ref() }.next {
            tail = n;
        }
        assert_eq!(tail, payload);
        assert!(unsafe { tail.as_ref() }.owns_data);
        assert_eq!(unsafe { tail.as_ref() }.len(), 0);

        // Freeing the chains returns every buffer, payload included.
        free_all(&mem, chains);
        assert_eq!(mem.available(PoolId::PacketBuf), 32);
        assert_eq!(mem.available(PoolId::NetHeader), 32);
        assert_eq!(mem.available(PoolId::MbufMeta), 32);
    }

    #[test]
    fn test_3000_byte_payload_fragments() {
        let mem = HeapPools::new(32);
        let ids = IpIdAllocator::new(1);
        let payload = payload_pbuf(&mem, 3000);

        let chains = build_fragments(&mem, &params(1500), payload, &ids);
        assert!(chains.len() >= 3);

        let mut idents = Vec::new();
        let mut prev_offset = None;
        for (i, chain) in chains.iter().enumerate() {
            let head = unsafe { chain.as_ref() };
            let last = i == chains.len() - 1;

            let eth = EthHeader::parse(head.bytes()).unwrap();
            assert_eq!(eth.ethertype, ETHERTYPE_IPV4);

            let ip = Ipv4Header::parse(&head.bytes()[ETH_HDR_LEN..]).unwrap();
            idents.push(ip.ident);
            assert_eq!(ip.more_fragments(), !last, "MF on all but the last");
            assert_eq!(ip.frag_offset_bytes() % FRAG_UNIT, 0);
            if let Some(prev) = prev_offset {
                assert!(ip.frag_offset_bytes() > prev, "offsets increase");
            }
            prev_offset = Some(ip.frag_offset_bytes());

            // Every fragment fits the MTU.
            assert!((ip.total_len as usize) <= 1500);
        }
        assert!(idents.windows(2).all(|w| w[0] == w[1]), "one ident per datagram");

        // First fragment carries the UDP header with total length and the
        // flow hash in the checksum field.
        let head = unsafe { chains[0].as_ref() };
        let udp = UdpHeader::parse(&head.bytes()[ETH_HDR_LEN + IP_HDR_LEN..]).unwrap();
        assert_eq!(udp.length as usize, UDP_HDR_LEN + 3000);
        let expect_hash = flow_hash(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            6000,
        );
        assert_eq!(udp.checksum, expect_hash);

        // Gathered views reproduce the payload exactly, in order.
        let mut gathered = Vec::new();
        for chain in &chains {
            gathered.extend_from_slice(&Pbuf::chain_payload_to_vec(*chain));
        }
        let expect: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        assert_eq!(gathered, expect);

        free_all(&mem, chains);
    }

    #[test]
    fn test_views_are_zero_copy() {
        let mem = HeapPools::new(32);
        let ids = IpIdAllocator::new(1);
        let payload = payload_pbuf(&mem, 3000);

        let chains = build_fragments(&mem, &params(1500), payload, &ids);

        // Each view points into the payload buffer itself.
        let base = unsafe { payload.as_ref() }.data.as_ptr() as usize;
        for chain in &chains {
            let view = unsafe { chain.as_ref() }.next.expect("header chains to a view");
            let v = unsafe { view.as_ref() };
            let p = v.data.as_ptr() as usize;
            assert!(p >= base && p < base + 3000);
            assert!(!v.owns_data);
        }

        free_all(&mem, chains);
    }

    #[test]
    fn test_single_queue_uses_full_id_space() {
        // One queue owns the whole 16-bit range.
        let ids = IpIdAllocator::new(1);
        assert_eq!(ids.next(0), 0);
        assert_eq!(ids.next(0), 1);
        assert_eq!(ids.next(0), 2);
    }

    #[test]
    fn test_ip_id_partitioning() {
        let ids = IpIdAllocator::new(4);
        // Each queue draws from its own quarter of the id space.
        for q in 0..4usize {
            let first = ids.next(q);
            let second = ids.next(q);
            assert_eq!(first, (q as u16) * 0x4000);
            assert_eq!(second, (q as u16) * 0x4000 + 1);
        }
    }

    proptest::proptest! {
        /// Fragments tile the UDP datagram exactly: offsets contiguous from
        /// zero, every frame within the MTU, gathered views reproducing the
        /// payload, more-fragments on all but the last.
        #[test]
        fn prop_fragments_tile_datagram(len in 1usize..3000, mtu in 576usize..2000) {
            let mem = HeapPools::new(64);
            let ids = IpIdAllocator::new(1);
            let payload = payload_pbuf(&mem, len);

            let chains = build_fragments(&mem, &params(mtu), payload, &ids);

            let mut covered = 0usize;
            for (i, chain) in chains.iter().enumerate() {
                let head = unsafe { chain.as_ref() };
                let ip = Ipv4Header::parse(&head.bytes()[ETH_HDR_LEN..]).unwrap();
                proptest::prop_assert_eq!(ip.frag_offset_bytes(), covered);
                proptest::prop_assert!(ip.total_len as usize <= mtu);
                let last = i == chains.len() - 1;
                proptest::prop_assert_eq!(ip.more_fragments(), !last && chains.len() > 1);
                covered += ip.payload_len();
            }
            proptest::prop_assert_eq!(covered, UDP_HDR_LEN + len);

            let mut gathered = Vec::new();
            for chain in &chains {
                gathered.extend_from_slice(&Pbuf::chain_payload_to_vec(*chain));
            }
            let expect: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            proptest::prop_assert_eq!(gathered, expect);

            free_all(&mem, chains);
        }
    }

    #[test]
    fn test_flow_hash_stable_and_flow_sensitive() {
        let a = flow_hash(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), 10, 20);
        let b = flow_hash(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), 10, 20);
        let c = flow_hash(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), 11, 20);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
