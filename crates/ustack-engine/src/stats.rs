//! Engine throughput counters
//!
//! Hot paths bump plain atomics; nothing else happens per packet. The
//! aggregated values are exported to the `metrics` recorder (and to logs)
//! from `publish`, which an embedding process calls on whatever cadence it
//! likes.

use std::sync::atomic::{AtomicU64, Ordering};
use ustack_common::StackResult;
use ustack_net::RxEvent;

/// Shared counters for one stack instance.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Frames handed to the receive path.
    rx_frames: AtomicU64,
    /// Complete datagrams that reached the sink.
    rx_datagrams: AtomicU64,
    /// Fragments accepted into reassembly.
    rx_fragments: AtomicU64,
    /// Frames rejected with a per-packet classification.
    rx_errors: AtomicU64,
    /// Datagrams transmitted.
    tx_datagrams: AtomicU64,
    /// Wire frames (fragments) transmitted.
    tx_fragments: AtomicU64,
    /// Transmit attempts that failed at the NIC.
    tx_errors: AtomicU64,
    /// Datagrams dropped because the delivery ring stayed full.
    sink_drops: AtomicU64,
}

/// Point-in-time copy of [`StackStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_frames: u64,
    pub rx_datagrams: u64,
    pub rx_fragments: u64,
    pub rx_errors: u64,
    pub tx_datagrams: u64,
    pub tx_fragments: u64,
    pub tx_errors: u64,
    pub sink_drops: u64,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_rx_frame(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx_datagram(&self) {
        self.rx_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx_fragment(&self) {
        self.rx_fragments.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify one receive-path outcome: every frame counts, queued
    /// fragments and per-packet rejections get their own classes.
    /// Delivered datagrams are counted by the sink that retains them.
    pub fn record_rx(&self, outcome: &StackResult<RxEvent>) {
        self.record_rx_frame();
        match outcome {
            Ok(RxEvent::FragmentQueued) => self.record_rx_fragment(),
            Err(_) => self.record_rx_error(),
            Ok(_) => {}
        }
    }

    #[inline]
    pub fn record_tx(&self, fragments: usize) {
        self.tx_datagrams.fetch_add(1, Ordering::Relaxed);
        self.tx_fragments.fetch_add(fragments as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tx_error(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_drop(&self) {
        self.sink_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_datagrams: self.rx_datagrams.load(Ordering::Relaxed),
            rx_fragments: self.rx_fragments.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_datagrams: self.tx_datagrams.load(Ordering::Relaxed),
            tx_fragments: self.tx_fragments.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            sink_drops: self.sink_drops.load(Ordering::Relaxed),
        }
    }

    /// Export the current totals to the installed `metrics` recorder.
    pub fn publish(&self) {
        let s = self.snapshot();
        metrics::counter!("ustack_rx_frames_total").absolute(s.rx_frames);
        metrics::counter!("ustack_rx_datagrams_total").absolute(s.rx_datagrams);
        metrics::counter!("ustack_rx_fragments_total").absolute(s.rx_fragments);
        metrics::counter!("ustack_rx_errors_total").absolute(s.rx_errors);
        metrics::counter!("ustack_tx_datagrams_total").absolute(s.tx_datagrams);
        metrics::counter!("ustack_tx_fragments_total").absolute(s.tx_fragments);
        metrics::counter!("ustack_tx_errors_total").absolute(s.tx_errors);
        metrics::counter!("ustack_sink_drops_total").absolute(s.sink_drops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StackStats::new();
        stats.record_rx_frame();
        stats.record_rx_frame();
        stats.record_rx_datagram();
        stats.record_tx(3);
        stats.record_tx(1);

        let s = stats.snapshot();
        assert_eq!(s.rx_frames, 2);
        assert_eq!(s.rx_datagrams, 1);
        assert_eq!(s.tx_datagrams, 2);
        assert_eq!(s.tx_fragments, 4);
        assert_eq!(s.tx_errors, 0);
    }

    #[test]
    fn test_rx_outcomes_classified() {
        use ustack_common::StackError;

        let stats = StackStats::new();
        stats.record_rx(&Ok(RxEvent::Arp));
        stats.record_rx(&Ok(RxEvent::DatagramDelivered));
        stats.record_rx(&Ok(RxEvent::FragmentQueued));
        stats.record_rx(&Err(StackError::NotForThisHost));

        let s = stats.snapshot();
        assert_eq!(s.rx_frames, 4);
        assert_eq!(s.rx_fragments, 1);
        assert_eq!(s.rx_errors, 1);
        // Delivery is the sink's to count.
        assert_eq!(s.rx_datagrams, 0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let stats = StackStats::new();
        let before = stats.snapshot();
        stats.record_sink_drop();
        assert_eq!(before.sink_drops, 0);
        assert_eq!(stats.snapshot().sink_drops, 1);
    }
}
