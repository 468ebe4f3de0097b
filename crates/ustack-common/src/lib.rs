//! Common types for the ustack data plane.
//!
//! Everything here is shared between the ring, protocol and engine crates:
//! the error taxonomy, small wire-adjacent value types and the stack
//! configuration. No packet-path logic lives in this crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::StackConfig;
pub use error::{StackError, StackResult};
pub use types::{MacAddr, PhysAddr, PoolId};
