//! Performance metrics collection and reporting.
//!
//! Counters are updated from every pipeline stage and summarized once when a
//! backup or restore finishes.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Latency samples kept per series
const MAX_SAMPLES: usize = 1000;

/// Performance metrics collector
pub struct PerformanceMetrics {
    /// Messages received from the broker or read from archives
    pub messages_processed: AtomicU64,
    /// Message body bytes processed
    pub bytes_uncompressed: AtomicU64,
    /// Compressed archive bytes written
    pub bytes_written: AtomicU64,
    /// Archive units sealed
    pub units_sealed: AtomicU64,
    /// Ack requests emitted
    pub acks_applied: AtomicU64,
    /// Messages published with a confirm
    pub messages_published: AtomicU64,
    /// Errors encountered
    pub errors: AtomicU64,
    seal_latencies_ns: RwLock<Vec<u64>>,
    publish_latencies_ns: RwLock<Vec<u64>>,
    start_time: Instant,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            bytes_uncompressed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            units_sealed: AtomicU64::new(0),
            acks_applied: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            seal_latencies_ns: RwLock::new(Vec::with_capacity(MAX_SAMPLES)),
            publish_latencies_ns: RwLock::new(Vec::with_capacity(MAX_SAMPLES)),
            start_time: Instant::now(),
        }
    }

    /// Record one message and its body size
    pub fn record_message(&self, body_bytes: u64) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uncompressed
            .fetch_add(body_bytes, Ordering::Relaxed);
    }

    /// Record a sealed unit
    pub fn record_unit(&self, compressed_bytes: u64, latency: Duration) {
        self.units_sealed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(compressed_bytes, Ordering::Relaxed);
        push_sample(&self.seal_latencies_ns, latency);
    }

    /// Record an ack the broker accepted
    pub fn record_ack(&self) {
        self.acks_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmed publish
    pub fn record_publish(&self, latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.publish_latencies_ns, latency);
    }

    /// Record error
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Calculate compression ratio
    pub fn compression_ratio(&self) -> f64 {
        let compressed = self.bytes_written.load(Ordering::Relaxed) as f64;
        let uncompressed = self.bytes_uncompressed.load(Ordering::Relaxed) as f64;
        if compressed > 0.0 {
            uncompressed / compressed
        } else {
            1.0
        }
    }

    /// Get messages per second
    pub fn messages_per_second(&self) -> f64 {
        let messages = self.messages_processed.load(Ordering::Relaxed) as f64;
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            messages / elapsed
        } else {
            0.0
        }
    }

    /// Generate a metrics report
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            elapsed_secs: self.elapsed().as_secs_f64(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            bytes_uncompressed: self.bytes_uncompressed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            units_sealed: self.units_sealed.load(Ordering::Relaxed),
            acks_applied: self.acks_applied.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            compression_ratio: self.compression_ratio(),
            messages_per_second: self.messages_per_second(),
            seal_latency: LatencyStats::from_samples(&self.seal_latencies_ns.read()),
            publish_latency: LatencyStats::from_samples(&self.publish_latencies_ns.read()),
        }
    }
}

fn push_sample(series: &RwLock<Vec<u64>>, duration: Duration) {
    let mut latencies = series.write();
    latencies.push(duration.as_nanos() as u64);
    if latencies.len() > MAX_SAMPLES {
        latencies.remove(0);
    }
}

/// Latency statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Calculate stats from samples (in nanoseconds)
    fn from_samples(samples: &[u64]) -> Self {
        let mut sorted: Vec<u64> = samples.to_vec();
        sorted.sort_unstable();

        let Some(&max) = sorted.last() else {
            return Self::default();
        };
        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let ns_to_ms = |ns: u64| ns as f64 / 1_000_000.0;
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        Self {
            count,
            avg_ms: ns_to_ms(sum / count as u64),
            p50_ms: ns_to_ms(at(0.5)),
            p95_ms: ns_to_ms(at(0.95)),
            p99_ms: ns_to_ms(at(0.99)),
            max_ms: ns_to_ms(max),
        }
    }
}

/// Metrics report
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub elapsed_secs: f64,
    pub messages_processed: u64,
    pub bytes_uncompressed: u64,
    pub bytes_written: u64,
    pub units_sealed: u64,
    pub acks_applied: u64,
    pub messages_published: u64,
    pub errors: u64,
    pub compression_ratio: f64,
    pub messages_per_second: f64,
    pub seal_latency: LatencyStats,
    pub publish_latency: LatencyStats,
}

impl MetricsReport {
    /// Machine-readable form of the report
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Performance Metrics ===")?;
        writeln!(f, "Duration: {:.2}s", self.elapsed_secs)?;
        writeln!(f, "Messages processed: {}", self.messages_processed)?;
        writeln!(f, "Messages/sec: {:.0}", self.messages_per_second)?;
        writeln!(f, "Units sealed: {}", self.units_sealed)?;
        writeln!(f, "Acks applied: {}", self.acks_applied)?;
        writeln!(f, "Messages published: {}", self.messages_published)?;
        writeln!(f, "Bytes written: {}", self.bytes_written)?;
        writeln!(f, "Compression ratio: {:.2}x", self.compression_ratio)?;
        writeln!(f, "Errors: {}", self.errors)?;
        if self.seal_latency.count > 0 {
            writeln!(f, "Seal latency (ms):")?;
            writeln!(
                f,
                "  avg={:.2} p50={:.2} p95={:.2} p99={:.2} max={:.2}",
                self.seal_latency.avg_ms,
                self.seal_latency.p50_ms,
                self.seal_latency.p95_ms,
                self.seal_latency.p99_ms,
                self.seal_latency.max_ms
            )?;
        }
        if self.publish_latency.count > 0 {
            writeln!(f, "Publish latency (ms):")?;
            writeln!(
                f,
                "  avg={:.2} p50={:.2} p95={:.2} p99={:.2} max={:.2}",
                self.publish_latency.avg_ms,
                self.publish_latency.p50_ms,
                self.publish_latency.p95_ms,
                self.publish_latency.p99_ms,
                self.publish_latency.max_ms
            )?;
        }
        Ok(())
    }
}
