//! Accumulator shapes stored in a [`KeyedTable`](super::table::KeyedTable).

use serde::Deserialize;

/// Which accumulator an aggregation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulatorKind {
    /// One occurrence counter per key.
    #[default]
    #[serde(alias = "Counter")]
    Counter,
    /// Several running sums per key.
    #[serde(alias = "Vector")]
    Vector,
    /// Fixed-width time histogram per key.
    #[serde(alias = "Histogram")]
    Histogram,
    /// Monotonic counter reported as delta since last read.
    #[serde(alias = "Diff")]
    Diff,
}

impl AccumulatorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Vector => "vector",
            Self::Histogram => "histogram",
            Self::Diff => "diff",
        }
    }
}

/// What a report cycle does with a record after rendering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryPolicy {
    /// The record is drained and dropped.
    Reset,
    /// The record stays in the table and is told it was reported.
    Keep,
}

/// Behaviour shared by all records a report cycle can drain.
pub trait Accumulator {
    const CARRY: CarryPolicy;

    /// Called on kept records after each report.
    fn reported(&mut self) {}
}

/// Monotonic counter reporting the increase since the last read.
///
/// A raw value lower than the previous one (wraparound or reset) adds
/// nothing. The first raw value only primes the counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffCounter {
    last_value: u64,
    delta: u64,
    primed: bool,
}

impl DiffCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new raw counter value. Returns the step added to the delta.
    pub fn update(&mut self, value: u64) -> u64 {
        let step = if self.primed && value > self.last_value {
            value - self.last_value
        } else {
            0
        };
        self.primed = true;
        self.last_value = value;
        self.delta = self.delta.saturating_add(step);
        step
    }

    /// Count occurrences directly instead of reading a raw counter.
    pub fn add(&mut self, n: u64) {
        self.primed = true;
        self.last_value = self.last_value.wrapping_add(n);
        self.delta = self.delta.saturating_add(n);
    }

    pub fn last_value(&self) -> u64 {
        self.last_value
    }

    pub fn delta(&self) -> u64 {
        self.delta
    }

    /// Read the delta and zero it. The last value is kept.
    pub fn take_delta(&mut self) -> u64 {
        std::mem::take(&mut self.delta)
    }
}

/// A row of diff counters, one per column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffRow {
    pub counters: Vec<DiffCounter>,
}

impl DiffRow {
    pub fn new(columns: usize) -> Self {
        Self {
            counters: vec![DiffCounter::new(); columns],
        }
    }

    pub fn delta(&self, idx: usize) -> u64 {
        self.counters.get(idx).map_or(0, DiffCounter::delta)
    }
}

impl Accumulator for DiffRow {
    const CARRY: CarryPolicy = CarryPolicy::Keep;

    fn reported(&mut self) {
        for c in &mut self.counters {
            c.take_delta();
        }
    }
}

/// Fixed-length vector of running sums.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterVector {
    sums: Vec<u64>,
}

impl CounterVector {
    pub fn new(columns: usize) -> Self {
        Self {
            sums: vec![0; columns],
        }
    }

    /// Add `value` to column `idx`. Out-of-range columns are ignored.
    pub fn add(&mut self, idx: usize, value: u64) {
        if let Some(sum) = self.sums.get_mut(idx) {
            *sum = sum.wrapping_add(value);
        }
    }

    pub fn get(&self, idx: usize) -> u64 {
        self.sums.get(idx).copied().unwrap_or(0)
    }

    pub fn values(&self) -> &[u64] {
        &self.sums
    }
}

impl Accumulator for CounterVector {
    const CARRY: CarryPolicy = CarryPolicy::Reset;
}

/// Time-ordered buckets of fixed count, never fewer than one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: Vec<u64>,
    max: u64,
}

impl Histogram {
    /// `size` is clamped to at least one bucket.
    pub fn new(size: usize) -> Self {
        Self {
            buckets: vec![0; size.max(1)],
            max: 0,
        }
    }

    /// Add `value` into bucket `min(offset, size - 1)`.
    pub fn insert(&mut self, offset: usize, value: u64) {
        let last = self.buckets.len() - 1;
        let bucket = &mut self.buckets[offset.min(last)];
        *bucket = bucket.wrapping_add(value);
        self.max = self.max.max(*bucket);
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Largest bucket value since the last reset.
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
        self.max = 0;
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One histogram per event column for a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistogramRow {
    pub columns: Vec<Histogram>,
}

impl HistogramRow {
    pub fn new(columns: usize, size: usize) -> Self {
        Self {
            columns: vec![Histogram::new(size); columns],
        }
    }

    pub fn max(&self) -> u64 {
        self.columns.iter().map(Histogram::max).max().unwrap_or(0)
    }
}

impl Accumulator for HistogramRow {
    const CARRY: CarryPolicy = CarryPolicy::Reset;
}
