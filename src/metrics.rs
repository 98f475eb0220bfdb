use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Invocations kept for latency percentiles
const LATENCY_WINDOW: usize = 1000;

/// Latency percentiles over the recent window, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyPercentiles {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// Sliding window of the most recent invocation latencies
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest once the window is full
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Nearest-rank percentiles of the current window; all zero when empty
    pub fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();

        let rank = |p: f64| {
            let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
            sorted[idx].as_secs_f64() * 1e6
        };
        LatencyPercentiles {
            p50_us: rank(0.50),
            p95_us: rank(0.95),
            p99_us: rank(0.99),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Per-stage metrics collector.
///
/// Created when the stage is appended, so callers can hold a handle before the
/// pipeline starts. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Items pulled from upstream
    accepted: Arc<AtomicU64>,
    /// Items pushed downstream (or consumed, for the last stage)
    emitted: Arc<AtomicU64>,
    /// Items the stage chose not to forward
    dropped: Arc<AtomicU64>,
    /// Times the stage's own high-water mark filled up and it stopped accepting
    blocks: Arc<AtomicU64>,
    /// Times a send waited on a full downstream buffer
    stalls: Arc<AtomicU64>,
    /// Items accepted but not yet emitted
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    latencies: LatencyWindow,
    started_at: Arc<OnceLock<Instant>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            accepted: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            blocks: Arc::new(AtomicU64::new(0)),
            stalls: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            latencies: LatencyWindow::new(LATENCY_WINDOW),
            started_at: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block event (high-water mark reached)
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send that had to wait for the downstream buffer
    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one invocation took
    pub fn record_latency(&self, latency: Duration) {
        self.latencies.record(latency);
    }

    pub(crate) fn set_in_flight(&self, n: usize) {
        self.in_flight.store(n, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(n, Ordering::Relaxed);
    }

    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn total_stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of accepted-but-not-emitted items ever observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    /// Emitted items per second since the stage started
    pub fn throughput_mps(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_emitted() as f64 / elapsed
        }
    }

    pub fn latency(&self) -> LatencyPercentiles {
        self.latencies.percentiles()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency();
        MetricsSnapshot {
            total_accepted: self.total_accepted(),
            total_emitted: self.total_emitted(),
            total_dropped: self.total_dropped(),
            total_blocks: self.total_blocks(),
            total_stalls: self.total_stalls(),
            peak_in_flight: self.peak_in_flight(),
            throughput_mps: self.throughput_mps(),
            latency_p50_us: latency.p50_us,
            latency_p95_us: latency.p95_us,
            latency_p99_us: latency.p99_us,
            elapsed: self.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_accepted: u64,
    pub total_emitted: u64,
    pub total_dropped: u64,
    pub total_blocks: u64,
    pub total_stalls: u64,
    pub peak_in_flight: usize,
    pub throughput_mps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Accepted: {}, Emitted: {}, Dropped: {}, Blocks: {}, Stalls: {}, Peak in flight: {}, \
             Throughput: {:.2} items/s, Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_accepted,
            self.total_emitted,
            self.total_dropped,
            self.total_blocks,
            self.total_stalls,
            self.peak_in_flight,
            self.throughput_mps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
