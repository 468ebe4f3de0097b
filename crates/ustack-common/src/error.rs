//! Error types for ustack

use crate::types::PoolId;
use thiserror::Error;

/// ustack error type
///
/// Packet-scoped errors (malformed frames, reassembly rejections) are
/// terminal for the offending packet only; the buffer is returned to its
/// pool and processing continues. Pool exhaustion is the one fatal case,
/// handled by abort at the allocation site rather than through this enum.
#[derive(Error, Debug)]
pub enum StackError {
    /// Frame shorter than the header it claims to carry
    #[error("truncated frame: need {need} bytes, got {got}")]
    TruncatedFrame { need: usize, got: usize },

    /// Ethernet type not handled by this stack
    #[error("unhandled ethernet type: {0:#06x}")]
    BadEtherType(u16),

    /// ARP field validation failure (hardware type, protocol type, lengths)
    #[error("bad ARP field: {0}")]
    BadArpField(&'static str),

    /// IP version other than 4
    #[error("bad IP version: {0}")]
    BadIpVersion(u8),

    /// IP header checksum mismatch
    #[error("bad IP header checksum")]
    BadIpChecksum,

    /// Datagram not addressed to this node
    #[error("datagram not for this host")]
    NotForThisHost,

    /// IP protocol number with no handler
    #[error("unknown IP protocol: {0}")]
    UnknownIpProtocol(u8),

    /// Fragment whose span would exceed the 16-bit datagram length space
    #[error("fragment at offset {offset} with {len} payload bytes exceeds datagram bounds")]
    FragmentBounds { offset: u16, len: u32 },

    /// No ARP entry for the destination within the retry window
    #[error("no ARP entry for {0}")]
    ArpUnresolved(std::net::Ipv4Addr),

    /// Fragment with an exact-offset match against an accepted fragment
    #[error("duplicate fragment at offset {offset}")]
    DuplicateFragment { offset: u16 },

    /// Fragment whose start falls inside an accepted fragment's span
    #[error("overlapping fragment at offset {offset}")]
    OverlappingFragment { offset: u16 },

    /// Named pool has no free buffers
    #[error("pool exhausted: {0:?}")]
    PoolExhausted(PoolId),

    /// Shared memory segment operation failed
    #[error("shared memory error: {0}")]
    Shm(String),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// NIC transmit failure
    #[error("NIC transmit error: {0}")]
    NicTx(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ustack
pub type StackResult<T> = Result<T, StackError>;

impl StackError {
    /// True for the malformed-frame class: the buffer is reusable and the
    /// error is terminal for this packet only.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            StackError::TruncatedFrame { .. }
                | StackError::BadEtherType(_)
                | StackError::BadArpField(_)
                | StackError::BadIpVersion(_)
                | StackError::BadIpChecksum
                | StackError::FragmentBounds { .. }
        )
    }

    /// True for reassembly rejections: the fragment is freed, the datagram
    /// stays in its collecting state.
    pub fn is_reassembly_reject(&self) -> bool {
        matches!(
            self,
            StackError::DuplicateFragment { .. } | StackError::OverlappingFragment { .. }
        )
    }
}
