//! ustack Protocol Engine
//!
//! Minimal Ethernet/ARP/IPv4/UDP stack with zero-copy scatter-gather
//! transmit and IP fragmentation/reassembly.
//!
//! # Data flow
//!
//! ```text
//! NIC RX ─▶ eth demux ─▶ ARP input ──▶ table update / reply
//!                    └─▶ IP input ──▶ reassembly ──▶ UDP input ─▶ sink
//!
//! sink (ring) ─▶ worker ─▶ udp_send ─▶ fragment + SG chain ─▶ NIC TX
//! ```
//!
//! Everything is per-stack-instance state: no globals, so multiple
//! independent stacks can coexist in one process.

pub mod arp;
pub mod ipv4;
pub mod mem;
pub mod nic;
pub mod pbuf;
pub mod stack;
pub mod udp;
pub mod wire;

pub use arp::ArpTable;
pub use ipv4::{CompletedDatagram, ReassemblySet};
pub use mem::{HeapPools, MemoryProvider};
pub use nic::{LoopbackNic, Nic};
pub use pbuf::Pbuf;
pub use stack::{NetStack, RxEvent};
pub use udp::{DatagramSink, Disposition, IpIdAllocator};
