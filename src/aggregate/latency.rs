use super::accumulator::{Accumulator, CarryPolicy};

/// Number of latency histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Bucket boundaries in nanoseconds.
/// 10 buckets: <1us, 1us-10us, 10us-100us, 100us-1ms, 1ms-10ms,
/// 10ms-100ms, 100ms-1s, 1s-10s, 10s-100s, 100s+.
const BOUNDARIES: [u64; NUM_BUCKETS - 1] = [
    1_000,           // 1 microsecond
    10_000,          // 10 microseconds
    100_000,         // 100 microseconds
    1_000_000,       // 1 millisecond
    10_000_000,      // 10 milliseconds
    100_000_000,     // 100 milliseconds
    1_000_000_000,   // 1 second
    10_000_000_000,  // 10 seconds
    100_000_000_000, // 100 seconds
];

/// Printable lower bound of each bucket.
pub const BUCKET_LABELS: [&str; NUM_BUCKETS] = [
    "<1us", "1us", "10us", "100us", "1ms", "10ms", "100ms", "1s", "10s", "100s+",
];

/// Returns the bucket index for a latency in nanoseconds.
pub fn bucket_index(value_ns: u64) -> usize {
    BOUNDARIES
        .iter()
        .position(|&boundary| value_ns < boundary)
        .unwrap_or(NUM_BUCKETS - 1)
}

/// Latency statistics for one stream of matched pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl LatencyStats {
    /// Creates empty stats with min at MAX and max at zero.
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            buckets: [0; NUM_BUCKETS],
        }
    }

    /// Records a latency value in nanoseconds.
    pub fn record(&mut self, value_ns: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(value_ns);
        self.min = self.min.min(value_ns);
        self.max = self.max.max(value_ns);
        self.buckets[bucket_index(value_ns)] += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Smallest value, or 0 when nothing was recorded.
    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn buckets(&self) -> &[u64; NUM_BUCKETS] {
        &self.buckets
    }

    /// Fold another set of stats into this one.
    pub fn merge(&mut self, other: &LatencyStats) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for LatencyStats {
    const CARRY: CarryPolicy = CarryPolicy::Reset;
}

/// Formats nanoseconds as microseconds with three decimals.
pub fn format_us(ns: f64) -> String {
    format!("{:.3}", ns / 1_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_boundaries() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(999), 0);
        assert_eq!(bucket_index(1_000), 1);
        assert_eq!(bucket_index(9_999), 1);
        assert_eq!(bucket_index(1_000_000), 4);
        assert_eq!(bucket_index(99_999_999_999), 8);
        assert_eq!(bucket_index(100_000_000_000), 9);
        assert_eq!(bucket_index(u64::MAX), 9);
    }

    #[test]
    fn test_record_tracks_min_max_avg() {
        let mut stats = LatencyStats::new();
        for v in [500u64, 1_500, 25_000] {
            stats.record(v);
        }
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.sum(), 27_000);
        assert_eq!(stats.min(), 500);
        assert_eq!(stats.max(), 25_000);
        assert!((stats.avg() - 9_000.0).abs() < f64::EPSILON);
        assert_eq!(stats.buckets()[0], 1);
        assert_eq!(stats.buckets()[1], 1);
        assert_eq!(stats.buckets()[2], 1);
    }

    #[test]
    fn test_empty_stats() {
        let stats = LatencyStats::new();
        assert_eq!(stats.min(), 0);
        assert_eq!(stats.max(), 0);
        assert_eq!(stats.avg(), 0.0);
    }

    #[test]
    fn test_merge() {
        let mut a = LatencyStats::new();
        a.record(10);
        let mut b = LatencyStats::new();
        b.record(5);
        b.record(2_000);
        a.merge(&b);
        a.merge(&LatencyStats::new());
        assert_eq!(a.count(), 3);
        assert_eq!(a.min(), 5);
        assert_eq!(a.max(), 2_000);
        assert_eq!(a.sum(), 2_015);
    }

    #[test]
    fn test_format_us() {
        assert_eq!(format_us(1_500.0), "1.500");
        assert_eq!(format_us(0.0), "0.000");
    }
}
