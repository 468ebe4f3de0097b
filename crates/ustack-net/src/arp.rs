//! ARP resolver table
//!
//! Fixed-size per-stack table: bounded scan for a match, then for an empty
//! slot, else eviction of slot 0. That eviction is FIFO-by-position as
//! observed in the original system, not a deliberate LRU policy; it is
//! reproduced here rather than redesigned, and flagged as a possible
//! quality issue for stakeholders.
//!
//! No retry/backoff timer is modeled: a higher-layer send spins until an
//! entry appears.

use crate::wire::{ArpPacket, EthHeader, ARP_OP_REPLY, ARP_OP_REQUEST, ETHERTYPE_ARP};
use std::net::Ipv4Addr;
use ustack_common::MacAddr;

/// Entries per table
pub const ARP_TABLE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArpState {
    Empty,
    Stable,
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    state: ArpState,
}

impl ArpEntry {
    const fn empty() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddr::ZERO,
            state: ArpState::Empty,
        }
    }
}

/// Fixed-size IP→MAC resolution table.
pub struct ArpTable {
    entries: [ArpEntry; ARP_TABLE_SIZE],
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            entries: [ArpEntry::empty(); ARP_TABLE_SIZE],
        }
    }

    /// Resolve `ip` to a MAC address.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|e| e.state == ArpState::Stable && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Record `ip` → `mac`, marking the entry stable. Returns the slot
    /// index used.
    pub fn update(&mut self, ip: Ipv4Addr, mac: MacAddr) -> usize {
        // Existing mapping first.
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| e.state == ArpState::Stable && e.ip == ip)
        {
            self.entries[i].mac = mac;
            return i;
        }

        // Then any empty slot; else evict slot 0 (observed behavior).
        let slot = self
            .entries
            .iter()
            .position(|e| e.state == ArpState::Empty)
            .unwrap_or(0);

        if self.entries[slot].state == ArpState::Stable {
            tracing::debug!(evicted = %self.entries[slot].ip, %ip, "ARP table full, evicting slot 0");
        }

        self.entries[slot] = ArpEntry {
            ip,
            mac,
            state: ArpState::Stable,
        };
        slot
    }

    /// Stable entry count.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ArpState::Stable)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a broadcast ARP request frame into `buf`, returning the frame
/// length.
pub fn build_request(
    buf: &mut [u8],
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> usize {
    EthHeader {
        dst: MacAddr::BROADCAST,
        src: local_mac,
        ethertype: ETHERTYPE_ARP,
    }
    .write(buf);

    ArpPacket {
        oper: ARP_OP_REQUEST,
        sender_mac: local_mac,
        sender_ip: local_ip,
        target_mac: MacAddr::ZERO,
        target_ip,
    }
    .write(&mut buf[crate::wire::ETH_HDR_LEN..]);

    crate::wire::ETH_HDR_LEN + crate::wire::ARP_PKT_LEN
}

/// Build a unicast ARP reply frame into `buf`, returning the frame length.
pub fn build_reply(
    buf: &mut [u8],
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
) -> usize {
    EthHeader {
        dst: requester_mac,
        src: local_mac,
        ethertype: ETHERTYPE_ARP,
    }
    .write(buf);

    ArpPacket {
        oper: ARP_OP_REPLY,
        sender_mac: local_mac,
        sender_ip: local_ip,
        target_mac: requester_mac,
        target_ip: requester_ip,
    }
    .write(&mut buf[crate::wire::ETH_HDR_LEN..]);

    crate::wire::ETH_HDR_LEN + crate::wire::ARP_PKT_LEN
}
