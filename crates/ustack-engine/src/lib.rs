//! Data-Plane Engine
//!
//! Ties the protocol stack to its transports: a pool of core-pinned worker
//! threads draining shared-memory channels on the transmit side, a
//! ring-backed sink handing received datagrams to the application on the
//! receive side, and atomic throughput counters over both.

pub mod stats;
pub mod worker;

pub use stats::{StackStats, StatsSnapshot};
pub use worker::{RingSink, TxTarget, WorkerPool};
