//! Small value types shared across the data plane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ethernet MAC address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// All-ones broadcast address
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    /// All-zeros address (unset)
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Raw octets
    #[inline(always)]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

/// Physical (DMA) address.
///
/// Distinct from a virtual pointer: a `PhysAddr` is handed to NIC
/// descriptors and must never be dereferenced by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Named buffer pools.
///
/// Closed enumeration: every allocation in the stack names one of these,
/// and a buffer is always freed back to the pool it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PoolId {
    /// NIC descriptor rings
    Descriptor = 0,
    /// Raw packet frames
    PacketBuf = 1,
    /// Pbuf descriptor metadata
    MbufMeta = 2,
    /// Reassembly staging buffers
    Reassembly = 3,
    /// Transmit network headers (Eth+IP+UDP)
    NetHeader = 4,
    /// UDP control blocks
    UdpControl = 5,
}

impl PoolId {
    /// All pools, in id order
    pub const ALL: [PoolId; 6] = [
        PoolId::Descriptor,
        PoolId::PacketBuf,
        PoolId::MbufMeta,
        PoolId::Reassembly,
        PoolId::NetHeader,
        PoolId::UdpControl,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display() {
        let mac = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_mac_broadcast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(!MacAddr::ZERO.is_broadcast());
    }

    #[test]
    fn test_pool_ids_distinct() {
        for (i, p) in PoolId::ALL.iter().enumerate() {
            assert_eq!(*p as usize, i);
        }
    }
}
