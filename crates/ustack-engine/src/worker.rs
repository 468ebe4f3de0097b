//! Core-pinned worker pool and ring-backed delivery
//!
//! Transmit side: one worker thread per channel, pinned to consecutive
//! logical cores, draining payload handles from its channel and driving
//! them through `NetStack::udp_send`. Receive side: [`RingSink`] pushes
//! delivered datagram chains into per-flow rings for the application to
//! drain.
//!
//! Workers never block. Every spin iteration checks the shared stop token,
//! so shutdown is a store plus a join.

use crate::stats::StackStats;
use std::net::Ipv4Addr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use ustack_common::{StackConfig, StackError, StackResult};
use ustack_net::pbuf::{from_handle, into_handle, Pbuf};
use ustack_net::udp::{flow_hash, DatagramMeta, DatagramSink, Disposition};
use ustack_net::NetStack;
use ustack_ring::{Channel, RingError};

/// Destination for worker transmit traffic.
#[derive(Debug, Clone, Copy)]
pub struct TxTarget {
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl TxTarget {
    /// Send to the configured gateway on the default data ports.
    pub fn from_config(cfg: &StackConfig) -> Self {
        Self {
            dst_ip: cfg.gateway_ip,
            src_port: 5000,
            dst_port: 5001,
        }
    }
}

/// Receive-side sink pushing delivered datagram chains into rings.
///
/// The channel is chosen by the datagram's flow hash, the same value the
/// transmit side stamps into the first fragment's UDP checksum field, so a
/// flow always lands on the same ring. A full ring is retried until the
/// stop token is raised; only then is the datagram dropped.
pub struct RingSink {
    channels: Vec<Arc<Channel>>,
    stop: Arc<AtomicBool>,
    stats: Arc<StackStats>,
}

impl RingSink {
    pub fn new(channels: Vec<Arc<Channel>>, stop: Arc<AtomicBool>, stats: Arc<StackStats>) -> Self {
        assert!(!channels.is_empty());
        Self { channels, stop, stats }
    }
}

impl DatagramSink for RingSink {
    fn deliver(&self, payload: NonNull<Pbuf>, meta: DatagramMeta) -> Disposition {
        let q = flow_hash(meta.src, meta.dst, meta.src_port, meta.dst_port) as usize
            % self.channels.len();
        let handle = into_handle(payload);

        loop {
            match self.channels[q].produce(handle) {
                Ok(()) => {
                    self.stats.record_rx_datagram();
                    return Disposition::Retained;
                }
                Err(RingError::Full) => {
                    if self.stop.load(Ordering::Relaxed) {
                        self.stats.record_sink_drop();
                        return Disposition::Release;
                    }
                    std::hint::spin_loop();
                }
                Err(e) => {
                    tracing::warn!(queue = q, error = %e, "delivery ring rejected datagram");
                    self.stats.record_sink_drop();
                    return Disposition::Release;
                }
            }
        }
    }
}

/// Pool of transmit workers, one per channel.
#[derive(Debug)]
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `cfg.num_workers` workers, worker `i` pinned to core
    /// `cfg.first_core + i` and draining `channels[i]`.
    pub fn start(
        cfg: &StackConfig,
        stack: Arc<NetStack>,
        channels: Vec<Arc<Channel>>,
        target: TxTarget,
        stats: Arc<StackStats>,
    ) -> StackResult<Self> {
        if channels.len() != cfg.num_workers {
            return Err(StackError::Config(format!(
                "{} channels for {} workers",
                channels.len(),
                cfg.num_workers
            )));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(cfg.num_workers);

        for (i, channel) in channels.into_iter().enumerate() {
            let stack = stack.clone();
            let stats = stats.clone();
            let stop = stop.clone();
            let core = cfg.first_core + i;
            let stats_batch = cfg.stats_batch;

            let handle = std::thread::Builder::new()
                .name(format!("ustack-worker-{i}"))
                .spawn(move || {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                        tracing::warn!(worker = i, core, "core pinning failed");
                    }
                    worker_loop(i, core, stack, channel, target, stats, stop, stats_batch);
                })
                .map_err(|e| StackError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self { stop, workers })
    }

    /// The token workers (and the sink) watch; share it with collaborators
    /// that must observe shutdown.
    pub fn stop_token(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Raise the stop token and join every worker.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("worker panicked: {e:?}");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    index: usize,
    core: usize,
    stack: Arc<NetStack>,
    channel: Arc<Channel>,
    target: TxTarget,
    stats: Arc<StackStats>,
    stop: Arc<AtomicBool>,
    stats_batch: u64,
) {
    // Gate 1: the NIC/stack pair must be up.
    while !stack.is_ready() {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        std::hint::spin_loop();
    }

    // Gate 2: the transmit destination must resolve. Worker 0 issues the
    // request; everyone spins until the table answers.
    if index == 0 {
        if let Err(e) = stack.arp_request(target.dst_ip) {
            tracing::warn!(worker = index, error = %e, "ARP request failed");
        }
    }
    while stack.arp_lookup(target.dst_ip).is_none() {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        std::hint::spin_loop();
    }

    tracing::info!(worker = index, core, dst = %target.dst_ip, "worker entering steady state");

    let mut batch = 0u64;
    let mut window = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match channel.consume() {
            Ok(handle) => {
                // udp_send owns the payload from here: it rides the
                // fragment chains to the NIC, or is freed on error.
                let payload = unsafe { from_handle(handle) };
                match stack.udp_send(
                    payload,
                    target.dst_ip,
                    target.src_port,
                    target.dst_port,
                    index as u32,
                ) {
                    Ok(fragments) => stats.record_tx(fragments),
                    Err(e) => {
                        stats.record_tx_error();
                        tracing::warn!(worker = index, error = %e, "transmit failed");
                    }
                }

                batch += 1;
                if batch == stats_batch {
                    let secs = window.elapsed().as_secs_f64();
                    tracing::info!(
                        worker = index,
                        datagrams = batch,
                        rate = format_args!("{:.0}/s", batch as f64 / secs),
                        "throughput window"
                    );
                    batch = 0;
                    window = Instant::now();
                }
            }
            Err(RingError::Empty) | Err(RingError::Contention) => std::hint::spin_loop(),
            Err(e) => {
                tracing::warn!(worker = index, error = %e, "channel consume failed");
            }
        }
    }

    tracing::info!(worker = index, "worker stopped");
}
