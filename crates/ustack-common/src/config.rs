//! Stack configuration
//!
//! One `StackConfig` per stack instance. Loaded from JSON or built in code;
//! `validate()` runs before any worker or channel is created.

use crate::error::{StackError, StackResult};
use crate::types::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Data-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Number of worker threads (one per channel / NIC queue)
    pub num_workers: usize,
    /// First logical core to pin workers to (worker i → core first_core + i)
    pub first_core: usize,
    /// NUMA node channels are placed on
    pub numa_node: usize,
    /// Ring capacity in slots (power of two)
    pub ring_capacity: u32,
    /// Link MTU in bytes
    pub mtu: usize,
    /// This node's IP address
    pub local_ip: Ipv4Addr,
    /// This node's MAC address
    pub local_mac: MacAddr,
    /// Peer to resolve before workers start transmitting
    pub gateway_ip: Ipv4Addr,
    /// Buffers per pool
    pub pool_size: usize,
    /// Packets between throughput counter resets/logs
    pub stats_batch: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            first_core: 0,
            numa_node: 0,
            ring_capacity: 1024,
            mtu: 1500,
            local_ip: Ipv4Addr::new(10, 0, 0, 2),
            local_mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            pool_size: 4096,
            stats_batch: 1 << 20,
        }
    }
}

impl StackConfig {
    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StackResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: StackConfig =
            serde_json::from_str(&raw).map_err(|e| StackError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate invariants the data plane relies on
    pub fn validate(&self) -> StackResult<()> {
        if self.num_workers == 0 {
            return Err(StackError::Config("num_workers must be nonzero".into()));
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(StackError::Config(format!(
                "ring_capacity must be a power of two, got {}",
                self.ring_capacity
            )));
        }
        if self.mtu < 576 || self.mtu > 9216 {
            return Err(StackError::Config(format!("mtu out of range: {}", self.mtu)));
        }
        if self.pool_size == 0 {
            return Err(StackError::Config("pool_size must be nonzero".into()));
        }
        if self.stats_batch == 0 {
            return Err(StackError::Config("stats_batch must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        StackConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_power_of_two_ring() {
        let cfg = StackConfig {
            ring_capacity: 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cfg = StackConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = StackConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StackConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ring_capacity, cfg.ring_capacity);
        assert_eq!(back.local_ip, cfg.local_ip);
        assert_eq!(back.local_mac, cfg.local_mac);
    }
}
