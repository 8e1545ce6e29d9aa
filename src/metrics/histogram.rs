//! Thread-safe fixed-bucket histogram for latency tracking.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed histogram buckets in microseconds.
///
/// Covers enqueue latencies (sub-millisecond) through batch write latencies
/// against a slow store (multi-second).
pub const HISTOGRAM_BUCKETS: [u64; 12] = [
    10,        // 10μs
    50,        // 50μs
    100,       // 100μs
    500,       // 500μs
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    50_000,    // 50ms
    100_000,   // 100ms
    500_000,   // 500ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Lock-free histogram with cumulative buckets, suitable for
/// `histogram_quantile()` in Prometheus.
pub struct Histogram {
    /// Sum of all observed values
    sum: AtomicU64,
    /// Total count of observations
    count: AtomicU64,
    /// Cumulative bucket counts
    buckets: [AtomicU64; 12],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: [ZERO; 12],
        }
    }

    /// Records an observation in microseconds.
    ///
    /// Uses `Ordering::Relaxed`; exact ordering is not needed for metrics.
    #[inline]
    pub fn observe(&self, value_us: u64) {
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        // Cumulative buckets: increment every bucket whose boundary covers
        // the value, as Prometheus expects.
        for (i, &boundary) in HISTOGRAM_BUCKETS.iter().enumerate() {
            if value_us <= boundary {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns `(sum, count, bucket_counts)`; bucket counts are cumulative.
    pub fn snapshot(&self) -> (u64, u64, [u64; 12]) {
        let sum = self.sum.load(Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);

        let mut buckets = [0u64; 12];
        for (i, bucket) in self.buckets.iter().enumerate() {
            buckets[i] = bucket.load(Ordering::Relaxed);
        }

        (sum, count, buckets)
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Formats the histogram in Prometheus exposition format.
    pub fn format_prometheus(&self, name: &str, help: &str) -> String {
        let (sum, count, buckets) = self.snapshot();

        let mut output = String::with_capacity(1024);

        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} histogram", name);

        for (i, &boundary) in HISTOGRAM_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}_bucket{{le=\"{}\"}} {}",
                name, boundary, buckets[i]
            );
        }

        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(output, "{}_sum {}", name, sum);
        let _ = writeln!(output, "{}_count {}", name, count);

        output
    }
}
