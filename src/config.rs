use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::accumulator::AccumulatorKind;
use crate::aggregate::report::Geometry;
use crate::aggregate::top::ColumnSpec;
use crate::correlate::strategy::{DuplicatePolicy, STRATEGY_NAMES};
use crate::correlate::window::DEFAULT_TIMELINE_CAPACITY;
use crate::tracer::event::EventDef;
use crate::tracer::parse::DEFAULT_KEY;

/// Upper bound on buckets per histogram. Every key carries one bucket
/// vector per column.
pub const MAX_HISTOGRAM_BUCKETS: usize = 4096;

/// Top-level configuration for proftop.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Report cycle period. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Key field for every event that does not name its own.
    /// Default: the thread id.
    #[serde(default)]
    pub key_field: Option<String>,

    /// Event schemas: numeric id to named u64 fields.
    #[serde(default)]
    pub events: Vec<EventDef>,

    /// Which analysis runs.
    #[serde(default)]
    pub mode: Mode,

    /// Keyed aggregation settings.
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Two-event correlation settings.
    #[serde(default)]
    pub correlate: CorrelateConfig,

    /// Trace printing settings.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Fallback output geometry.
    #[serde(default)]
    pub display: DisplayConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Analysis mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Aggregate,
    Correlate,
    Trace,
}

/// Keyed aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// Accumulator kind. Selects the top, hrcount or stat aggregator.
    #[serde(default)]
    pub accumulator: AccumulatorKind,

    /// Columns ranked first, in order.
    #[serde(default)]
    pub rank_fields: Vec<String>,

    /// Report columns for counter/vector accumulators.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,

    /// Events shown by histogram/diff accumulators. Empty means all.
    #[serde(default)]
    pub events: Vec<String>,

    /// Buckets per histogram. Default: interval / period.
    #[serde(default)]
    pub histogram_size: Option<usize>,

    /// Histogram bucket width. Default: 100ms.
    #[serde(default, with = "humantime_serde")]
    pub period: Option<Duration>,

    /// Field summed (histogram) or diffed (diff) per sample.
    #[serde(default)]
    pub value_field: Option<String>,

    /// Group by comm only.
    #[serde(default)]
    pub only_comm: bool,

    /// Group by key and comm, printing the comm.
    #[serde(default)]
    pub show_comm: bool,
}

/// One correlated event pair.
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub first: String,
    pub second: String,
    /// Overrides `correlate.strategy` for this pair.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Two-event correlation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelateConfig {
    /// Strategy for every pair without its own. Default: "delay".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Pending first events older than this are swept. Default: 1s.
    #[serde(default = "default_window_ns")]
    pub window_ns: u64,

    /// Declared pairs.
    #[serde(default)]
    pub pairs: Vec<PairConfig>,

    /// Cap on pending first events per pair.
    #[serde(default)]
    pub max_pending: Option<usize>,

    /// Samples retained for event windows. Default: 65536.
    #[serde(default = "default_timeline_capacity")]
    pub timeline_capacity: usize,

    /// Print pairs slower than this with their window.
    #[serde(default)]
    pub greater_than_ns: Option<u64>,

    /// Cap on detail lines per cycle; 0 is unlimited. Default: 10.
    #[serde(default = "default_first_n")]
    pub first_n: usize,

    /// Per-key delay breakdown.
    #[serde(default)]
    pub per_key: bool,

    /// Allocation size field of the first event. Default: "bytes_alloc".
    #[serde(default = "default_bytes_field")]
    pub bytes_field: String,

    /// Syscall number field of the first event. Default: "id".
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Return value field of the second event. Default: "ret".
    #[serde(default = "default_ret_field")]
    pub ret_field: String,

    /// Duplicate first event handling. Default: the strategy's own.
    #[serde(default)]
    pub duplicate: Option<DuplicatePolicy>,
}

/// Trace printing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Lines buffered per cycle before the rest are counted as dropped.
    /// Default: 10000.
    #[serde(default = "default_trace_max_lines")]
    pub max_lines: usize,
}

/// Fallback output geometry when stdout size is unknown.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub columns: Option<usize>,
    #[serde(default)]
    pub rows: Option<usize>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090"). Disabled when absent.
    #[serde(default)]
    pub addr: Option<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_period() -> Duration {
    Duration::from_millis(100)
}

fn default_strategy() -> String {
    "delay".to_string()
}

fn default_window_ns() -> u64 {
    1_000_000_000
}

fn default_timeline_capacity() -> usize {
    DEFAULT_TIMELINE_CAPACITY
}

fn default_first_n() -> usize {
    10
}

fn default_bytes_field() -> String {
    "bytes_alloc".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_ret_field() -> String {
    "ret".to_string()
}

fn default_trace_max_lines() -> usize {
    10_000
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            key_field: None,
            events: Vec::new(),
            mode: Mode::default(),
            aggregate: AggregateConfig::default(),
            correlate: CorrelateConfig::default(),
            trace: TraceConfig::default(),
            display: DisplayConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            accumulator: AccumulatorKind::default(),
            rank_fields: Vec::new(),
            columns: Vec::new(),
            events: Vec::new(),
            histogram_size: None,
            period: None,
            value_field: None,
            only_comm: false,
            show_comm: false,
        }
    }
}

impl Default for CorrelateConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            window_ns: default_window_ns(),
            pairs: Vec::new(),
            max_pending: None,
            timeline_capacity: default_timeline_capacity(),
            greater_than_ns: None,
            first_n: default_first_n(),
            per_key: false,
            bytes_field: default_bytes_field(),
            id_field: default_id_field(),
            ret_field: default_ret_field(),
            duplicate: None,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_lines: default_trace_max_lines(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.events.is_empty() {
            bail!("at least one event must be declared");
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for event in &self.events {
            if event.name.is_empty() {
                bail!("event {} has an empty name", event.id);
            }
            if !ids.insert(event.id) {
                bail!("event id {} declared more than once", event.id);
            }
            if !names.insert(event.name.as_str()) {
                bail!("event name {:?} declared more than once", event.name);
            }
        }

        match self.mode {
            Mode::Aggregate => self.validate_aggregate(&names)?,
            Mode::Correlate => self.validate_correlate(&names)?,
            Mode::Trace => {
                if self.trace.max_lines == 0 {
                    bail!("trace.max_lines must be positive");
                }
            }
        }

        Ok(())
    }

    fn validate_aggregate(&self, names: &HashSet<&str>) -> Result<()> {
        let agg = &self.aggregate;

        if agg.histogram_size == Some(0) {
            bail!("aggregate.histogram_size must be positive");
        }
        if agg.period.is_some_and(|p| p.is_zero()) {
            bail!("aggregate.period must be positive");
        }
        if agg.accumulator == AccumulatorKind::Histogram {
            let (period, size) = self.histogram_shape();
            if size > MAX_HISTOGRAM_BUCKETS {
                bail!(
                    "aggregate histogram has {size} buckets of {period:?}, max {MAX_HISTOGRAM_BUCKETS}"
                );
            }
        }

        for column in &agg.columns {
            if let Some(event) = &column.event {
                if !names.contains(event.as_str()) {
                    bail!("column {}: event {event:?} is not declared", column.name);
                }
            }
        }
        for event in &agg.events {
            if !names.contains(event.as_str()) {
                bail!("aggregate.events: event {event:?} is not declared");
            }
        }

        // Diff and histogram columns are events; counter/vector columns are
        // the configured column names.
        let columns: Vec<&str> = match agg.accumulator {
            AccumulatorKind::Counter | AccumulatorKind::Vector => {
                if agg.columns.is_empty() {
                    if agg.accumulator == AccumulatorKind::Vector {
                        bail!("vector accumulator needs at least one column");
                    }
                    vec!["count"]
                } else {
                    agg.columns.iter().map(|c| c.name.as_str()).collect()
                }
            }
            AccumulatorKind::Histogram | AccumulatorKind::Diff => {
                if agg.events.is_empty() {
                    self.events.iter().map(|e| e.name.as_str()).collect()
                } else {
                    agg.events.iter().map(String::as_str).collect()
                }
            }
        };
        for field in &agg.rank_fields {
            if !columns.contains(&field.as_str()) {
                bail!("rank field {field:?} is not a report column");
            }
        }

        Ok(())
    }

    fn validate_correlate(&self, names: &HashSet<&str>) -> Result<()> {
        let corr = &self.correlate;

        if corr.window_ns == 0 {
            bail!("correlate.window_ns must be positive");
        }
        if corr.pairs.is_empty() {
            bail!("correlate.pairs must declare at least one pair");
        }
        if corr.timeline_capacity == 0 {
            bail!("correlate.timeline_capacity must be positive");
        }
        if corr.max_pending == Some(0) {
            bail!("correlate.max_pending must be positive");
        }

        for pair in &corr.pairs {
            for event in [&pair.first, &pair.second] {
                if !names.contains(event.as_str()) {
                    bail!("pair {} -> {}: event {event:?} is not declared", pair.first, pair.second);
                }
            }
            let strategy = pair.strategy.as_deref().unwrap_or(&corr.strategy);
            if !STRATEGY_NAMES.contains(&strategy) && strategy != "kmemprof" {
                bail!("pair {} -> {}: unknown strategy {strategy:?}", pair.first, pair.second);
            }
        }

        Ok(())
    }

    /// Display name of the key column, without the `common_` prefix.
    pub fn key_label(&self) -> &str {
        let key = self.key_field.as_deref().unwrap_or(DEFAULT_KEY);
        key.strip_prefix("common_").unwrap_or(key)
    }

    /// Histogram bucket width and count, defaulting either from the other.
    pub fn histogram_shape(&self) -> (Duration, usize) {
        let agg = &self.aggregate;
        match (agg.period, agg.histogram_size) {
            (Some(period), Some(size)) => (period, size),
            (Some(period), None) => (period, buckets_in(self.interval, period)),
            (None, Some(size)) => {
                let period = self.interval / u32::try_from(size).unwrap_or(u32::MAX);
                (period.max(Duration::from_nanos(1)), size)
            }
            (None, None) => {
                let period = default_period().min(self.interval);
                (period, buckets_in(self.interval, period))
            }
        }
    }
}

fn buckets_in(interval: Duration, period: Duration) -> usize {
    let n = interval.as_nanos() / period.as_nanos().max(1);
    usize::try_from(n).unwrap_or(usize::MAX).max(1)
}

impl DisplayConfig {
    /// Output geometry. `COLUMNS`/`LINES` win over the configured values.
    pub fn geometry(&self, tty: bool) -> Geometry {
        let env = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
        Geometry {
            cols: env("COLUMNS").or(self.columns),
            rows: env("LINES").or(self.rows),
            tty,
        }
    }
}
