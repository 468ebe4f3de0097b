//! On-the-wire header formats
//!
//! Ethernet II, ARP (hardware=Ethernet, protocol=IPv4), IPv4 and UDP.
//! Every multi-byte field is big-endian on the wire and converted exactly
//! at this boundary; the rest of the stack works in host order.
//!
//! One deliberate deviation from standard UDP: on the first fragment of a
//! transmitted datagram the UDP checksum field carries a flow-distribution
//! hash, not a checksum. Receivers of this system expect it; do not
//! "fix" it.

use std::net::Ipv4Addr;
use ustack_common::{MacAddr, StackError, StackResult};

pub const ETH_HDR_LEN: usize = 14;
pub const IP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
pub const ARP_PKT_LEN: usize = 28;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_UDP: u8 = 17;

/// More-fragments bit in the IPv4 flags/offset field
pub const IP_FLAG_MF: u16 = 0x2000;
/// 13-bit fragment offset mask (units of 8 bytes)
pub const IP_OFFSET_MASK: u16 = 0x1FFF;
/// Fragment offsets advance in units of this many bytes
pub const FRAG_UNIT: usize = 8;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

#[inline(always)]
fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

#[inline(always)]
fn put16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn need(buf: &[u8], need: usize) -> StackResult<()> {
    if buf.len() < need {
        return Err(StackError::TruncatedFrame { need, got: buf.len() });
    }
    Ok(())
}

// ============================================================================
// Ethernet II
// ============================================================================

/// Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    pub fn parse(buf: &[u8]) -> StackResult<Self> {
        need(buf, ETH_HDR_LEN)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: be16(buf, 12),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.dst.octets());
        buf[6..12].copy_from_slice(&self.src.octets());
        put16(buf, 12, self.ethertype);
    }
}

// ============================================================================
// ARP
// ============================================================================

/// ARP packet, Ethernet/IPv4 layout only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub oper: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse and validate the fixed fields. Any mismatch is a hard fail:
    /// the frame is classified and dropped.
    pub fn parse(buf: &[u8]) -> StackResult<Self> {
        need(buf, ARP_PKT_LEN)?;
        if be16(buf, 0) != 1 {
            return Err(StackError::BadArpField("hardware type"));
        }
        if be16(buf, 2) != ETHERTYPE_IPV4 {
            return Err(StackError::BadArpField("protocol type"));
        }
        if buf[4] != 6 {
            return Err(StackError::BadArpField("hardware length"));
        }
        if buf[5] != 4 {
            return Err(StackError::BadArpField("protocol length"));
        }
        let oper = be16(buf, 6);
        if oper != ARP_OP_REQUEST && oper != ARP_OP_REPLY {
            return Err(StackError::BadArpField("operation"));
        }

        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&buf[8..14]);
        target_mac.copy_from_slice(&buf[18..24]);

        Ok(Self {
            oper,
            sender_mac: MacAddr(sender_mac),
            sender_ip: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            target_mac: MacAddr(target_mac),
            target_ip: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        put16(buf, 0, 1); // Ethernet
        put16(buf, 2, ETHERTYPE_IPV4);
        buf[4] = 6;
        buf[5] = 4;
        put16(buf, 6, self.oper);
        buf[8..14].copy_from_slice(&self.sender_mac.octets());
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.octets());
        buf[24..28].copy_from_slice(&self.target_ip.octets());
    }
}

// ============================================================================
// IPv4
// ============================================================================

/// IPv4 header (no options).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    /// 3-bit flags + 13-bit fragment offset, host order
    pub flags_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(buf: &[u8]) -> StackResult<Self> {
        need(buf, IP_HDR_LEN)?;
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(StackError::BadIpVersion(version));
        }
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        if ihl < IP_HDR_LEN {
            return Err(StackError::TruncatedFrame { need: IP_HDR_LEN, got: ihl });
        }

        Ok(Self {
            tos: buf[1],
            total_len: be16(buf, 2),
            ident: be16(buf, 4),
            flags_offset: be16(buf, 6),
            ttl: buf[8],
            protocol: buf[9],
            checksum: be16(buf, 10),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        })
    }

    /// Verify the header checksum over `buf` (which must start at the
    /// IP header).
    pub fn verify_checksum(buf: &[u8]) -> StackResult<()> {
        need(buf, IP_HDR_LEN)?;
        if internet_checksum(&buf[..IP_HDR_LEN]) != 0 {
            return Err(StackError::BadIpChecksum);
        }
        Ok(())
    }

    /// Write the header, computing the checksum field.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = 0x45; // version 4, IHL 5
        buf[1] = self.tos;
        put16(buf, 2, self.total_len);
        put16(buf, 4, self.ident);
        put16(buf, 6, self.flags_offset);
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        put16(buf, 10, 0);
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        let csum = internet_checksum(&buf[..IP_HDR_LEN]);
        put16(buf, 10, csum);
    }

    /// True when the more-fragments flag is set.
    #[inline(always)]
    pub fn more_fragments(&self) -> bool {
        self.flags_offset & IP_FLAG_MF != 0
    }

    /// Fragment offset in bytes.
    #[inline(always)]
    pub fn frag_offset_bytes(&self) -> usize {
        (self.flags_offset & IP_OFFSET_MASK) as usize * FRAG_UNIT
    }

    /// True when this packet is part of a fragmented datagram.
    #[inline(always)]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset_bytes() != 0
    }

    /// Payload length according to the header.
    #[inline(always)]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(IP_HDR_LEN)
    }
}

// ============================================================================
// UDP
// ============================================================================

/// UDP header. `checksum` is a flow-distribution hash on transmitted first
/// fragments; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(buf: &[u8]) -> StackResult<Self> {
        need(buf, UDP_HDR_LEN)?;
        Ok(Self {
            src_port: be16(buf, 0),
            dst_port: be16(buf, 2),
            length: be16(buf, 4),
            checksum: be16(buf, 6),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        put16(buf, 0, self.src_port);
        put16(buf, 2, self.dst_port);
        put16(buf, 4, self.length);
        put16(buf, 6, self.checksum);
    }
}

/// RFC 1071 internet checksum.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eth_round_trip() {
        let hdr = EthHeader {
            dst: MacAddr::BROADCAST,
            src: MacAddr([2, 0, 0, 0, 0, 1]),
            ethertype: ETHERTYPE_ARP,
        };
        let mut buf = [0u8; ETH_HDR_LEN];
        hdr.write(&mut buf);
        assert_eq!(buf[12], 0x08);
        assert_eq!(buf[13], 0x06);
        assert_eq!(EthHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_eth_truncated() {
        assert!(matches!(
            EthHeader::parse(&[0u8; 9]),
            Err(StackError::TruncatedFrame { need: 14, got: 9 })
        ));
    }

    #[test]
    fn test_arp_round_trip_and_validation() {
        let pkt = ArpPacket {
            oper: ARP_OP_REQUEST,
            sender_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            sender_ip: Ipv4Addr::new(10, 0, 0, 2),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::new(10, 0, 0, 1),
        };
        let mut buf = [0u8; ARP_PKT_LEN];
        pkt.write(&mut buf);
        assert_eq!(ArpPacket::parse(&buf).unwrap(), pkt);

        // Hardware type mismatch is a hard fail.
        buf[1] = 6;
        assert!(matches!(
            ArpPacket::parse(&buf),
            Err(StackError::BadArpField("hardware type"))
        ));
    }

    #[test]
    fn test_ipv4_round_trip_checksum() {
        let hdr = Ipv4Header {
            tos: 0,
            total_len: 1500,
            ident: 0x42,
            flags_offset: IP_FLAG_MF | 10,
            ttl: 64,
            protocol: IP_PROTO_UDP,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
        };
        let mut buf = [0u8; IP_HDR_LEN];
        hdr.write(&mut buf);

        Ipv4Header::verify_checksum(&buf).unwrap();
        let back = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(back.total_len, 1500);
        assert!(back.more_fragments());
        assert_eq!(back.frag_offset_bytes(), 80);
        assert!(back.is_fragment());

        // Corrupt a byte: checksum must fail.
        buf[8] = 63;
        assert!(matches!(
            Ipv4Header::verify_checksum(&buf),
            Err(StackError::BadIpChecksum)
        ));
    }

    #[test]
    fn test_ipv4_rejects_version() {
        let mut buf = [0u8; IP_HDR_LEN];
        buf[0] = 0x65; // version 6
        assert!(matches!(
            Ipv4Header::parse(&buf),
            Err(StackError::BadIpVersion(6))
        ));
    }

    #[test]
    fn test_udp_round_trip() {
        let hdr = UdpHeader {
            src_port: 5000,
            dst_port: 6000,
            length: 3008,
            checksum: 0xBEEF,
        };
        let mut buf = [0u8; UDP_HDR_LEN];
        hdr.write(&mut buf);
        assert_eq!(UdpHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_internet_checksum_known_vector() {
        // RFC 1071 worked example.
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }
}
