//! Per-queue and aggregate counters plus the periodic reporter.
//!
//! Workers bump these with relaxed increments on the hot path; the
//! reporter thread and the control plane only ever read them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::registry::Registry;

#[derive(Debug, Default)]
pub struct QueueStats {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
}

#[derive(Debug)]
pub struct Stats {
    queues: Vec<QueueStats>,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub parse_errors: AtomicU64,
    pub send_errors: AtomicU64,
    pub fallback_sends: AtomicU64,
}

impl Stats {
    pub fn new(num_queues: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: (0..num_queues).map(|_| QueueStats::default()).collect(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            fallback_sends: AtomicU64::new(0),
        })
    }

    pub fn queue(&self, queue_id: usize) -> &QueueStats {
        &self.queues[queue_id]
    }

    pub fn packets_received(&self) -> u64 {
        self.queues
            .iter()
            .map(|q| q.packets_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn packets_sent(&self) -> u64 {
        self.queues
            .iter()
            .map(|q| q.packets_sent.load(Ordering::Relaxed))
            .sum()
    }

    /// Log a full snapshot of the counters.
    pub fn report(&self, destinations: usize) {
        for (queue_id, q) in self.queues.iter().enumerate() {
            info!(
                queue_id,
                packets_received = q.packets_received.load(Ordering::Relaxed),
                packets_sent = q.packets_sent.load(Ordering::Relaxed),
                "queue statistics"
            );
        }
        info!(
            packets_received = self.packets_received(),
            packets_sent = self.packets_sent(),
            bytes_received = self.bytes_received.load(Ordering::Relaxed),
            bytes_sent = self.bytes_sent.load(Ordering::Relaxed),
            parse_errors = self.parse_errors.load(Ordering::Relaxed),
            send_errors = self.send_errors.load(Ordering::Relaxed),
            fallback_sends = self.fallback_sends.load(Ordering::Relaxed),
            destinations,
            "replicator statistics"
        );
    }
}

/// Log the counters every `interval` until the running flag clears. Sleeps
/// in 1-second steps so shutdown is observed promptly.
pub fn spawn_reporter(
    stats: Arc<Stats>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("metrics".into())
        .spawn(move || {
            let mut elapsed = Duration::ZERO;
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                elapsed += Duration::from_secs(1);
                if elapsed >= interval {
                    stats.report(registry.len());
                    elapsed = Duration::ZERO;
                }
            }
        })
        .context("spawning metrics thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_sum_across_queues() {
        let stats = Stats::new(3);
        stats.queue(0).packets_received.fetch_add(5, Ordering::Relaxed);
        stats.queue(2).packets_received.fetch_add(7, Ordering::Relaxed);
        stats.queue(1).packets_sent.fetch_add(3, Ordering::Relaxed);

        assert_eq!(stats.packets_received(), 12);
        assert_eq!(stats.packets_sent(), 3);
    }
}
