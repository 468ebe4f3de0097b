//! IPv4 fragmentation & reassembly state machine
//!
//! One [`ReassemblyRecord`] per in-flight datagram, keyed by
//! (src, dst, identification). States:
//!
//! ```text
//! COLLECTING ──(gaps closed && last fragment seen)──▶ COMPLETE ─▶ destroyed
//! ```
//!
//! Fragments are insertion-sorted by offset through the pbuf chain, with
//! the span annotations (`frag_start`/`frag_end`) carried in the pbuf
//! descriptor. A fragment whose start exactly matches an accepted fragment
//! is a duplicate; one whose start falls inside an accepted span is an
//! overlap. Both are rejected with distinct classifications, the fragment
//! is dropped, and the datagram stays COLLECTING.
//!
//! There is no reassembly timeout: a stalled partial datagram holds its
//! buffers until external intervention. Reproduced as observed in the
//! original system and flagged as an open question, not fixed here.

use crate::pbuf::Pbuf;
use crate::wire::Ipv4Header;
use std::net::Ipv4Addr;
use std::ptr::NonNull;
use ustack_common::{StackError, StackResult};

/// Datagram identity for reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ident: u16,
}

/// A reassembled datagram handed back to the caller. The chain is sorted
/// by offset and contiguous from 0 through `total_len`.
#[derive(Debug)]
pub struct CompletedDatagram {
    pub head: NonNull<Pbuf>,
    pub header: Ipv4Header,
    pub total_len: u32,
    pub frag_count: u32,
}

/// Per-datagram collecting state.
struct ReassemblyRecord {
    key: FragKey,
    /// Copy of the defining IP header (first fragment to arrive).
    header: Ipv4Header,
    /// Offset-sorted fragment chain.
    head: Option<NonNull<Pbuf>>,
    frag_count: u32,
    saw_last: bool,
    /// Datagram length, known once the last fragment has been seen.
    total_len: u32,
}

impl ReassemblyRecord {
    fn new(key: FragKey, header: Ipv4Header) -> Self {
        Self {
            key,
            header,
            head: None,
            frag_count: 0,
            saw_last: false,
            total_len: 0,
        }
    }

    /// Insert one fragment, sorted by start offset.
    fn insert(&mut self, mut pbuf: NonNull<Pbuf>, start: u16, end: u16) -> StackResult<()> {
        {
            let pb = unsafe { pbuf.as_mut() };
            pb.frag_start = start;
            pb.frag_end = end;
            pb.next = None;
        }

        // Reject duplicates and overlaps against accepted fragments.
        let mut cur = self.head;
        while let Some(p) = cur {
            let pb = unsafe { p.as_ref() };
            if pb.frag_start == start {
                return Err(StackError::DuplicateFragment { offset: start });
            }
            if start > pb.frag_start && start < pb.frag_end {
                return Err(StackError::OverlappingFragment { offset: start });
            }
            cur = pb.next;
        }

        // Splice into position.
        match self.head {
            None => self.head = Some(pbuf),
            Some(h) if unsafe { h.as_ref() }.frag_start > start => {
                unsafe { pbuf.as_mut() }.next = Some(h);
                self.head = Some(pbuf);
            }
            Some(h) => {
                let mut prev = h;
                while let Some(n) = unsafe { prev.as_ref() }.next {
                    if unsafe { n.as_ref() }.frag_start > start {
                        break;
                    }
                    prev = n;
                }
                unsafe {
                    pbuf.as_mut().next = prev.as_ref().next;
                    prev.as_mut().next = Some(pbuf);
                }
            }
        }
        self.frag_count += 1;
        Ok(())
    }

    /// COMPLETE when the last fragment has been seen and the chain covers
    /// 0..total_len without gaps.
    fn is_complete(&self) -> bool {
        if !self.saw_last {
            return false;
        }
        let mut expected = 0u16;
        let mut cur = self.head;
        while let Some(p) = cur {
            let pb = unsafe { p.as_ref() };
            if pb.frag_start != expected {
                return false;
            }
            expected = pb.frag_end;
            cur = pb.next;
        }
        expected as u32 == self.total_len
    }
}

/// Per-stack set of in-flight reassembly records. Not shared across
/// threads; each receive path owns its own set.
pub struct ReassemblySet {
    records: Vec<ReassemblyRecord>,
}

// Safety: the records own their chains exclusively; no pbuf is aliased
// while it sits in the set, so moving the set between threads is sound.
unsafe impl Send for ReassemblySet {}

impl Default for ReassemblySet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblySet {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Feed one fragment into the state machine.
    ///
    /// The set takes ownership of `pbuf` on `Ok`; on `Err` the caller
    /// still owns it and must free it. `Ok(Some(_))` transfers the whole
    /// completed chain back to the caller and destroys the record.
    ///
    /// `pbuf.payload_len` must already describe the fragment's IP payload
    /// bytes and `pbuf.hdr_len` must cover everything before them.
    pub fn insert(
        &mut self,
        hdr: &Ipv4Header,
        pbuf: NonNull<Pbuf>,
    ) -> StackResult<Option<CompletedDatagram>> {
        let key = FragKey {
            src: hdr.src,
            dst: hdr.dst,
            ident: hdr.ident,
        };
        let start = hdr.frag_offset_bytes() as u16;
        let len = unsafe { pbuf.as_ref() }.payload_len;
        // The datagram length space is 16 bits; a span past it is
        // malformed, not a wrap back to low offsets.
        let end = start as u64 + len as u64;
        if end > u16::MAX as u64 {
            return Err(StackError::FragmentBounds { offset: start, len });
        }
        let end = end as u16;

        let idx = match self.records.iter().position(|r| r.key == key) {
            Some(i) => i,
            None => {
                // First fragment of a new datagram: COLLECTING.
                self.records.push(ReassemblyRecord::new(key, *hdr));
                self.records.len() - 1
            }
        };

        let rec = &mut self.records[idx];
        rec.insert(pbuf, start, end)?;

        if !hdr.more_fragments() {
            rec.saw_last = true;
            rec.total_len = end as u32;
        }

        if rec.is_complete() {
            // COMPLETE: hand the chain over and destroy the record.
            let rec = self.records.swap_remove(idx);
            let mut head = rec.head.expect("complete record has a chain");
            unsafe { head.as_mut() }.frag_count = rec.frag_count;
            return Ok(Some(CompletedDatagram {
                head,
                header: rec.header,
                total_len: rec.total_len,
                frag_count: rec.frag_count,
            }));
        }

        Ok(None)
    }

    /// In-flight datagram count.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Tear down every record, returning the chains so the caller can
    /// free them. Shutdown path only.
    pub fn purge(&mut self) -> Vec<NonNull<Pbuf>> {
        self.records.drain(..).filter_map(|r| r.head).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapPools;
    use crate::wire::{IP_FLAG_MF, IP_PROTO_UDP};
    use ustack_common::PoolId;

    fn frag_header(ident: u16, offset_bytes: usize, more: bool) -> Ipv4Header {
        let mut flags_offset = (offset_bytes / 8) as u16;
        if more {
            flags_offset |= IP_FLAG_MF;
        }
        Ipv4Header {
            tos: 0,
            total_len: 0,
            ident,
            flags_offset,
            ttl: 64,
            protocol: IP_PROTO_UDP,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    fn frag_pbuf(mem: &HeapPools, fill: u8, len: u32) -> NonNull<Pbuf> {
        let mut p = Pbuf::alloc(mem, PoolId::PacketBuf, 0, 0);
        unsafe {
            let pb = p.as_mut();
            pb.payload_len = len;
            pb.bytes_mut()[..len as usize].fill(fill);
        }
        p
    }

    #[test]
    fn test_in_order_reassembly() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        let r = set.insert(&frag_header(7, 0, true), frag_pbuf(&mem, 0xA, 8)).unwrap();
        assert!(r.is_none());
        assert_eq!(set.len(), 1);

        let done = set
            .insert(&frag_header(7, 8, false), frag_pbuf(&mem, 0xB, 4))
            .unwrap()
            .expect("datagram completes");

        assert_eq!(done.total_len, 12);
        assert_eq!(done.frag_count, 2);
        assert_eq!(set.len(), 0, "record destroyed on completion");

        let bytes = Pbuf::chain_payload_to_vec(done.head);
        assert_eq!(&bytes[..8], &[0xA; 8]);
        assert_eq!(&bytes[8..], &[0xB; 4]);
        unsafe { Pbuf::free_chain(done.head, &mem, 0) };
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        // Last, middle, first.
        assert!(set.insert(&frag_header(9, 16, false), frag_pbuf(&mem, 3, 8)).unwrap().is_none());
        assert!(set.insert(&frag_header(9, 8, true), frag_pbuf(&mem, 2, 8)).unwrap().is_none());
        let done = set
            .insert(&frag_header(9, 0, true), frag_pbuf(&mem, 1, 8))
            .unwrap()
            .expect("datagram completes");

        assert_eq!(done.total_len, 24);
        let bytes = Pbuf::chain_payload_to_vec(done.head);
        assert_eq!(&bytes[..8], &[1; 8]);
        assert_eq!(&bytes[8..16], &[2; 8]);
        assert_eq!(&bytes[16..], &[3; 8]);
        unsafe { Pbuf::free_chain(done.head, &mem, 0) };
    }

    #[test]
    fn test_duplicate_fragment_rejected() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        set.insert(&frag_header(1, 8, true), frag_pbuf(&mem, 0, 8)).unwrap();

        let dup = frag_pbuf(&mem, 0, 8);
        let err = set.insert(&frag_header(1, 8, true), dup).unwrap_err();
        assert!(matches!(err, StackError::DuplicateFragment { offset: 8 }));
        unsafe { Pbuf::free_chain(dup, &mem, 0) };

        // Still COLLECTING.
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_overlapping_fragment_rejected_and_incomplete() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        set.insert(&frag_header(2, 0, true), frag_pbuf(&mem, 0, 16)).unwrap();

        // Starts inside the accepted 0..16 span.
        let overlap = frag_pbuf(&mem, 0, 8);
        let err = set.insert(&frag_header(2, 8, false), overlap).unwrap_err();
        assert!(matches!(err, StackError::OverlappingFragment { offset: 8 }));
        unsafe { Pbuf::free_chain(overlap, &mem, 0) };

        // The datagram never completed.
        assert_eq!(set.len(), 1);
        let done = set.insert(&frag_header(2, 16, false), frag_pbuf(&mem, 0, 8)).unwrap();
        assert!(done.is_some(), "non-overlapping tail still completes it");
        unsafe { Pbuf::free_chain(done.unwrap().head, &mem, 0) };
    }

    #[test]
    fn test_gap_blocks_completion() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        assert!(set.insert(&frag_header(3, 0, true), frag_pbuf(&mem, 0, 8)).unwrap().is_none());
        // Hole at 8..16; last fragment seen but not complete.
        assert!(set.insert(&frag_header(3, 16, false), frag_pbuf(&mem, 0, 8)).unwrap().is_none());
        assert_eq!(set.len(), 1);

        let done = set.insert(&frag_header(3, 8, true), frag_pbuf(&mem, 0, 8)).unwrap();
        assert!(done.is_some());
        unsafe { Pbuf::free_chain(done.unwrap().head, &mem, 0) };
    }

    #[test]
    fn test_fragment_past_datagram_bounds_rejected() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        let bad = frag_pbuf(&mem, 0, 16);
        let err = set.insert(&frag_header(4, 65528, false), bad).unwrap_err();
        assert!(matches!(err, StackError::FragmentBounds { offset: 65528, .. }));
        assert!(err.is_malformed_frame());
        assert!(set.is_empty(), "no record created for the rejected fragment");
        unsafe { Pbuf::free_chain(bad, &mem, 0) };
    }

    #[test]
    fn test_distinct_datagrams_tracked_separately() {
        let mem = HeapPools::new(16);
        let mut set = ReassemblySet::new();

        set.insert(&frag_header(10, 0, true), frag_pbuf(&mem, 0, 8)).unwrap();
        set.insert(&frag_header(11, 0, true), frag_pbuf(&mem, 0, 8)).unwrap();
        assert_eq!(set.len(), 2);

        for head in set.purge() {
            unsafe { Pbuf::free_chain(head, &mem, 0) };
        }
        assert!(set.is_empty());
    }
}
