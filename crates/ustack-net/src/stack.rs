//! Per-instance protocol engine
//!
//! `NetStack` owns everything one stack instance needs: the ARP table, the
//! reassembly set, the IP-id source and handles to the memory and NIC
//! collaborators. Nothing is global, so multiple independent stacks can
//! run in one process.
//!
//! Buffer ownership through the receive path is linear: `rx_frame` takes
//! the frame and every exit path frees it exactly once, except when the
//! reassembly set or the sink retains it.

use crate::arp::{self, ArpTable};
use crate::ipv4::ReassemblySet;
use crate::mem::MemoryProvider;
use crate::nic::Nic;
use crate::pbuf::Pbuf;
use crate::udp::{
    build_fragments, DatagramMeta, DatagramSink, Disposition, IpIdAllocator, UdpTxParams,
};
use crate::wire::{
    ArpPacket, EthHeader, Ipv4Header, UdpHeader, ARP_OP_REQUEST, ETHERTYPE_ARP, ETHERTYPE_IPV4,
    ETH_HDR_LEN, IP_HDR_LEN, IP_PROTO_UDP, UDP_HDR_LEN,
};
use parking_lot::{Mutex, RwLock};
use std::hint::spin_loop;
use std::net::Ipv4Addr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ustack_common::{MacAddr, PoolId, StackConfig, StackError, StackResult};

/// What the receive path did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    /// ARP frame handled: table updated, reply sent if we were the target.
    Arp,
    /// A complete UDP datagram reached the sink.
    DatagramDelivered,
    /// Fragment accepted; the datagram is still collecting.
    FragmentQueued,
}

/// One protocol stack instance.
pub struct NetStack {
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    mtu: usize,
    device: u32,
    mem: Arc<dyn MemoryProvider>,
    nic: Arc<dyn Nic>,
    sink: Arc<dyn DatagramSink>,
    arp: RwLock<ArpTable>,
    // The receive path is single-threaded per stack; this lock is
    // uncontended and exists to keep the type Sync for the transmit side.
    reasm: Mutex<ReassemblySet>,
    ids: IpIdAllocator,
    ready: AtomicBool,
}

impl NetStack {
    pub fn new(
        cfg: &StackConfig,
        mem: Arc<dyn MemoryProvider>,
        nic: Arc<dyn Nic>,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        Self {
            local_mac: cfg.local_mac,
            local_ip: cfg.local_ip,
            mtu: cfg.mtu,
            device: 0,
            mem,
            nic,
            sink,
            arp: RwLock::new(ArpTable::new()),
            reasm: Mutex::new(ReassemblySet::new()),
            ids: IpIdAllocator::new(cfg.num_workers.next_power_of_two()),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the NIC/stack pair ready; workers gate on this.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn mem(&self) -> &Arc<dyn MemoryProvider> {
        &self.mem
    }

    #[inline]
    fn release(&self, chain: NonNull<Pbuf>) {
        unsafe { Pbuf::free_chain(chain, &*self.mem, self.device) };
    }

    // ------------------------------------------------------------------
    // ARP
    // ------------------------------------------------------------------

    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp.read().lookup(ip)
    }

    /// Broadcast an ARP request for `target`.
    pub fn arp_request(&self, target: Ipv4Addr) -> StackResult<()> {
        let mut frame = Pbuf::alloc(&*self.mem, PoolId::NetHeader, self.device, 0);
        {
            let pb = unsafe { frame.as_mut() };
            let n = arp::build_request(pb.bytes_mut(), self.local_mac, self.local_ip, target);
            pb.hdr_len = n as u32;
        }
        tracing::debug!(%target, "sending ARP request");
        if let Err(e) = self.nic.send_packets(&[frame], self.device, 0) {
            self.release(frame);
            return Err(e);
        }
        Ok(())
    }

    fn arp_input(&self, eth_payload: &[u8]) -> StackResult<()> {
        let pkt = ArpPacket::parse(eth_payload)?;

        // Record the sender mapping regardless of operation.
        self.arp.write().update(pkt.sender_ip, pkt.sender_mac);

        if pkt.oper == ARP_OP_REQUEST && pkt.target_ip == self.local_ip {
            let mut reply = Pbuf::alloc(&*self.mem, PoolId::NetHeader, self.device, 0);
            {
                let pb = unsafe { reply.as_mut() };
                let n = arp::build_reply(
                    pb.bytes_mut(),
                    self.local_mac,
                    self.local_ip,
                    pkt.sender_mac,
                    pkt.sender_ip,
                );
                pb.hdr_len = n as u32;
            }
            tracing::debug!(requester = %pkt.sender_ip, "answering ARP request");
            if let Err(e) = self.nic.send_packets(&[reply], self.device, 0) {
                self.release(reply);
                return Err(e);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one received frame.
    ///
    /// Takes ownership of `frame` (`hdr_len == 0`, `payload_len` = frame
    /// length). Classified errors free the buffer before returning; the
    /// error is terminal for this packet only.
    pub fn rx_frame(&self, mut frame: NonNull<Pbuf>) -> StackResult<RxEvent> {
        let eth = match EthHeader::parse(unsafe { frame.as_ref() }.bytes()) {
            Ok(e) => e,
            Err(e) => {
                self.release(frame);
                return Err(e);
            }
        };

        match eth.ethertype {
            ETHERTYPE_ARP => {
                let r = self.arp_input(&unsafe { frame.as_ref() }.bytes()[ETH_HDR_LEN..]);
                self.release(frame);
                r.map(|_| RxEvent::Arp)
            }
            ETHERTYPE_IPV4 => {
                let ip = match self.ip_validate(unsafe { frame.as_ref() }.bytes()) {
                    Ok(ip) => ip,
                    Err(e) => {
                        self.release(frame);
                        return Err(e);
                    }
                };

                // Re-scope the buffer: headers up front, IP payload after.
                {
                    let pb = unsafe { frame.as_mut() };
                    pb.hdr_len = (ETH_HDR_LEN + IP_HDR_LEN) as u32;
                    pb.payload_len = ip.payload_len() as u32;
                }

                if ip.is_fragment() {
                    // The set owns the buffer on Ok; on Err it is still ours.
                    let done = self.reasm.lock().insert(&ip, frame);
                    match done {
                        Err(e) => {
                            self.release(frame);
                            Err(e)
                        }
                        Ok(None) => Ok(RxEvent::FragmentQueued),
                        Ok(Some(d)) => self.udp_input(d.head, &d.header),
                    }
                } else {
                    self.udp_input(frame, &ip)
                }
            }
            other => {
                self.release(frame);
                Err(StackError::BadEtherType(other))
            }
        }
    }

    /// Checksum, version, addressing and length checks on an IPv4 frame.
    fn ip_validate(&self, frame_bytes: &[u8]) -> StackResult<Ipv4Header> {
        let ip_bytes = &frame_bytes[ETH_HDR_LEN..];
        Ipv4Header::verify_checksum(ip_bytes)?;
        let ip = Ipv4Header::parse(ip_bytes)?;

        if ip.dst != self.local_ip {
            return Err(StackError::NotForThisHost);
        }
        if ip_bytes.len() < ip.total_len as usize {
            return Err(StackError::TruncatedFrame {
                need: ip.total_len as usize,
                got: ip_bytes.len(),
            });
        }
        Ok(ip)
    }

    /// Deliver a complete datagram (single buffer or reassembled chain) to
    /// the UDP layer. Owns `head`; frees it unless the sink retains it.
    fn udp_input(&self, mut head: NonNull<Pbuf>, ip: &Ipv4Header) -> StackResult<RxEvent> {
        if ip.protocol != IP_PROTO_UDP {
            self.release(head);
            return Err(StackError::UnknownIpProtocol(ip.protocol));
        }

        // The Ethernet header of the first (offset 0) fragment is still at
        // the front of the head segment's buffer.
        let (eth, udp) = {
            let pb = unsafe { head.as_ref() };
            let eth = EthHeader::parse(pb.bytes());
            let udp = UdpHeader::parse(pb.payload());
            match (eth, udp) {
                (Ok(e), Ok(u)) => (e, u),
                (Err(e), _) | (_, Err(e)) => {
                    self.release(head);
                    return Err(e);
                }
            }
        };

        // The UDP header lives in the first segment; everything after it
        // across the chain is application payload.
        {
            let pb = unsafe { head.as_mut() };
            pb.hdr_len += UDP_HDR_LEN as u32;
            pb.payload_len -= UDP_HDR_LEN as u32;
        }

        // Opportunistic learn of a new sender.
        if self.arp.read().lookup(ip.src).is_none() {
            self.arp.write().update(ip.src, eth.src);
        }

        let meta = DatagramMeta {
            src: ip.src,
            dst: ip.dst,
            src_port: udp.src_port,
            dst_port: udp.dst_port,
            len: Pbuf::chain_payload_len(head),
        };
        tracing::trace!(
            src = %meta.src,
            src_port = meta.src_port,
            dst_port = meta.dst_port,
            len = meta.len,
            "delivering datagram"
        );

        match self.sink.deliver(head, meta) {
            Disposition::Release => self.release(head),
            Disposition::Retained => {}
        }
        Ok(RxEvent::DatagramDelivered)
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    /// Transmit an application payload as UDP, fragmenting as needed.
    ///
    /// Takes ownership of `payload` on every outcome: on success it rides
    /// the last fragment chain to the NIC and is freed with it; on error it
    /// is freed here. Returns the number of fragments sent.
    ///
    /// Callers gate on ARP resolution before steady-state transmit, so the
    /// lookup spin only covers table-update races. It is bounded: the entry
    /// can vanish under eviction pressure, and an unbounded spin would hold
    /// a worker past shutdown.
    pub fn udp_send(
        &self,
        payload: NonNull<Pbuf>,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        queue: u32,
    ) -> StackResult<usize> {
        const ARP_SPIN_LIMIT: u32 = 1 << 16;

        let mut spins = 0u32;
        let dst_mac = loop {
            if let Some(mac) = self.arp_lookup(dst_ip) {
                break mac;
            }
            spins += 1;
            if spins >= ARP_SPIN_LIMIT {
                self.release(payload);
                return Err(StackError::ArpUnresolved(dst_ip));
            }
            spin_loop();
        };

        let params = UdpTxParams {
            local_mac: self.local_mac,
            local_ip: self.local_ip,
            dst_mac,
            dst_ip,
            src_port,
            dst_port,
            mtu: self.mtu,
            device: self.device,
            core: queue,
            queue,
        };

        let chains = build_fragments(&*self.mem, &params, payload, &self.ids);
        let n = chains.len();
        match self.nic.send_packets(&chains, self.device, queue) {
            Ok(sent) if sent == n => Ok(n),
            Ok(sent) => {
                for c in &chains[sent..] {
                    self.release(*c);
                }
                Err(StackError::NicTx(format!("accepted {sent} of {n} fragments")))
            }
            Err(e) => {
                for c in &chains {
                    self.release(*c);
                }
                Err(e)
            }
        }
    }
}
