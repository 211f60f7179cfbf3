//! Pull statistics: lock-free counters plus a smoothed-rate emitter.
//!
//! Counters are plain atomics bumped by the pipeline stages. The emitter
//! samples them every 100 ms, folds the per-second deltas into an
//! exponential moving average (published as f64 bit patterns), and pushes
//! an immutable snapshot to the caller's channel once per second plus a
//! final snapshot on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
const SAMPLES_PER_SEC: u64 = 10;
const SMOOTHING_WEIGHT: f64 = 0.1;

/// An immutable statistics snapshot published through the stats channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PullStats {
    /// Bytes fully sent to the sink.
    pub finished_send_bytes: u64,
    /// Bytes buffered for sending (packed or staged for upload).
    pub buffered_send_bytes: u64,
    /// Smoothed send throughput, bytes per second.
    pub send_bytes_per_sec: f64,
    /// Chunks requested from the source so far.
    pub total_source_chunks: u64,
    /// Chunks received from the source so far.
    pub fetched_source_chunks: u64,
    /// Compressed bytes received from the source so far.
    pub fetched_source_bytes: u64,
    /// Smoothed fetch throughput, bytes per second.
    pub fetched_source_bytes_per_sec: f64,
}

/// Internal counters shared across the pipeline stages.
#[derive(Debug, Default)]
pub(crate) struct PullCounters {
    finished_send_bytes: AtomicU64,
    buffered_send_bytes: AtomicU64,
    send_bytes_per_sec_bits: AtomicU64,
    total_source_chunks: AtomicU64,
    fetched_source_chunks: AtomicU64,
    fetched_source_bytes: AtomicU64,
    fetched_source_bytes_per_sec_bits: AtomicU64,
}

impl PullCounters {
    pub(crate) fn new() -> Self {
        PullCounters::default()
    }

    pub(crate) fn add_finished_send_bytes(&self, n: u64) {
        self.finished_send_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_buffered_send_bytes(&self, n: u64) {
        self.buffered_send_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_total_source_chunks(&self, n: u64) {
        self.total_source_chunks.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn note_fetched(&self, payload_len: u64) {
        self.fetched_source_chunks.fetch_add(1, Ordering::Relaxed);
        self.fetched_source_bytes.fetch_add(payload_len, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PullStats {
        PullStats {
            finished_send_bytes: self.finished_send_bytes.load(Ordering::Relaxed),
            buffered_send_bytes: self.buffered_send_bytes.load(Ordering::Relaxed),
            send_bytes_per_sec: f64::from_bits(self.send_bytes_per_sec_bits.load(Ordering::Relaxed)),
            total_source_chunks: self.total_source_chunks.load(Ordering::Relaxed),
            fetched_source_chunks: self.fetched_source_chunks.load(Ordering::Relaxed),
            fetched_source_bytes: self.fetched_source_bytes.load(Ordering::Relaxed),
            fetched_source_bytes_per_sec: f64::from_bits(
                self.fetched_source_bytes_per_sec_bits.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Folds one per-second sample into the moving average.
///
/// Seeds with the first non-zero sample; floors below 1 byte/s to zero so
/// idle displays do not flicker.
fn smooth_rate(current: f64, sample: f64) -> f64 {
    let smoothed = if current == 0.0 {
        sample
    } else {
        current + SMOOTHING_WEIGHT * (sample - current)
    };
    if smoothed < 1.0 {
        0.0
    } else {
        smoothed
    }
}

fn update_rate(cell: &AtomicU64, delta: u64) {
    let sample = (delta * SAMPLES_PER_SEC) as f64;
    let current = f64::from_bits(cell.load(Ordering::Relaxed));
    cell.store(smooth_rate(current, sample).to_bits(), Ordering::Relaxed);
}

/// Handle to the spawned emitter task.
pub(crate) struct StatsEmitter {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatsEmitter {
    /// Spawns the sampling and publishing loops.
    pub(crate) fn spawn(counters: Arc<PullCounters>, updates: mpsc::Sender<PullStats>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_emitter(counters, updates, shutdown_rx));
        StatsEmitter { shutdown, task }
    }

    /// Stops the emitter, waiting for the final snapshot to be published.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run_emitter(
    counters: Arc<PullCounters>,
    updates: mpsc::Sender<PullStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sample = tokio::time::interval(SAMPLE_INTERVAL);
    let mut publish = tokio::time::interval(PUBLISH_INTERVAL);
    let mut last_send = 0u64;
    let mut last_fetched = 0u64;

    loop {
        tokio::select! {
            _ = sample.tick() => {
                let send = counters.finished_send_bytes.load(Ordering::Relaxed);
                let fetched = counters.fetched_source_bytes.load(Ordering::Relaxed);
                update_rate(&counters.send_bytes_per_sec_bits, send - last_send);
                update_rate(&counters.fetched_source_bytes_per_sec_bits, fetched - last_fetched);
                last_send = send;
                last_fetched = fetched;
            }
            _ = publish.tick() => {
                let _ = updates.send(counters.snapshot()).await;
            }
            _ = shutdown.changed() => {
                let _ = updates.send(counters.snapshot()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_rate_seeds_with_first_sample() {
        assert_eq!(smooth_rate(0.0, 1000.0), 1000.0);
    }

    #[test]
    fn smooth_rate_weights_new_samples() {
        let smoothed = smooth_rate(1000.0, 2000.0);
        assert!((smoothed - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn smooth_rate_floors_trickle_to_zero() {
        assert_eq!(smooth_rate(0.9, 0.0), 0.0);
        assert_eq!(smooth_rate(0.0, 0.5), 0.0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let counters = PullCounters::new();
        counters.add_total_source_chunks(3);
        counters.note_fetched(100);
        counters.note_fetched(50);
        counters.add_buffered_send_bytes(150);
        counters.add_finished_send_bytes(75);

        let snap = counters.snapshot();
        assert_eq!(snap.total_source_chunks, 3);
        assert_eq!(snap.fetched_source_chunks, 2);
        assert_eq!(snap.fetched_source_bytes, 150);
        assert_eq!(snap.buffered_send_bytes, 150);
        assert_eq!(snap.finished_send_bytes, 75);
    }

    #[tokio::test]
    async fn emitter_publishes_final_snapshot_on_stop() {
        let counters = Arc::new(PullCounters::new());
        let (tx, mut rx) = mpsc::channel(64);

        let emitter = StatsEmitter::spawn(counters.clone(), tx);
        counters.note_fetched(4096);
        emitter.stop().await;

        let mut last = None;
        while let Some(snap) = rx.recv().await {
            last = Some(snap);
        }
        let last = last.expect("at least the final snapshot");
        assert_eq!(last.fetched_source_chunks, 1);
        assert_eq!(last.fetched_source_bytes, 4096);
    }

    #[tokio::test]
    async fn emitter_tolerates_dropped_receiver() {
        let counters = Arc::new(PullCounters::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let emitter = StatsEmitter::spawn(counters, tx);
        emitter.stop().await;
    }
}
