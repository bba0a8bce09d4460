//! Drives one analysis from raw records to rendered frames.

pub mod trace;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::accumulator::AccumulatorKind;
use crate::aggregate::hrcount::{HrCount, HrCountOptions};
use crate::aggregate::report::{Frame, Geometry, RenderSink};
use crate::aggregate::stat::Stat;
use crate::aggregate::top::{Top, TopOptions};
use crate::config::{Config, CorrelateConfig, Mode};
use crate::correlate::object::ObjectOptions;
use crate::correlate::strategy::{self, StrategyOptions};
use crate::correlate::CorrelationClass;
use crate::export::health::HealthMetrics;
use crate::tracer::event::Sample;
use crate::tracer::parse::{Decoder, SchemaDecoder};
use crate::tracer::stats::{EventStats, IngestStats};
use crate::tracer::{self, SampleSource};

use self::trace::TracePrinter;

/// Records buffered between the reader task and the session.
const READ_QUEUE: usize = 4096;

/// One running analysis: an aggregator, the correlation engine or the
/// trace printer.
pub trait Analysis: Send {
    fn name(&self) -> &'static str;

    /// Account one decoded sample.
    fn ingest(&mut self, sample: &Sample);

    /// Render one report cycle into `frame`. `now_ns` is the trace clock.
    fn report(&mut self, now_ns: u64, geometry: &Geometry, frame: &mut Frame);

    /// Output geometry changed.
    fn resize(&mut self, _geometry: &Geometry) {}

    /// Final report at shutdown.
    fn finish(&mut self, now_ns: u64, geometry: &Geometry, frame: &mut Frame) {
        self.report(now_ns, geometry, frame);
    }

    fn stats(&self) -> AnalysisStats {
        AnalysisStats::default()
    }
}

/// Size and running totals of an analysis, read once per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    /// Table rows, or pending first events for correlation.
    pub entries: usize,
    pub matched: u64,
    pub unmatched: u64,
    pub expired: u64,
    pub evicted: u64,
}

/// Owns the decoder, the analysis and the render sink.
///
/// Every call runs to completion before the next one starts, so a report
/// never observes a half-applied sample.
pub struct Session {
    decoder: SchemaDecoder,
    analysis: Box<dyn Analysis>,
    sink: Box<dyn RenderSink>,
    geometry: Geometry,
    health: Option<Arc<HealthMetrics>>,
    ingest: IngestStats,
    events: EventStats,
    published: AnalysisStats,
    now_ns: u64,
    finished: bool,
    frame: Frame,
}

impl Session {
    pub fn new(
        decoder: SchemaDecoder,
        analysis: Box<dyn Analysis>,
        sink: Box<dyn RenderSink>,
        geometry: Geometry,
    ) -> Self {
        Self {
            decoder,
            analysis,
            sink,
            geometry,
            health: None,
            ingest: IngestStats::default(),
            events: EventStats::new(),
            published: AnalysisStats::default(),
            now_ns: 0,
            finished: false,
            frame: Frame::new(),
        }
    }

    /// Build the decoder and analysis described by `cfg`.
    pub fn from_config(cfg: &Config, sink: Box<dyn RenderSink>, geometry: Geometry) -> Result<Self> {
        let decoder = SchemaDecoder::new(&cfg.events, cfg.key_field.as_deref())
            .context("building event schemas")?;
        let analysis = build_analysis(cfg, &decoder, &geometry)?;

        info!(
            analysis = analysis.name(),
            events = cfg.events.len(),
            "session configured"
        );

        Ok(Self::new(decoder, analysis, sink, geometry))
    }

    /// Publish ingest and report metrics to `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Decode one raw record and hand it to the analysis. Returns whether
    /// the record was accepted.
    pub fn process(&mut self, raw: &[u8]) -> bool {
        self.ingest.received += 1;
        if let Some(health) = &self.health {
            health.samples_received.inc();
        }

        if self.finished {
            self.ingest.dropped += 1;
            if let Some(health) = &self.health {
                health.samples_dropped.inc();
            }
            return false;
        }

        match self.decoder.decode(raw) {
            Ok(sample) => {
                self.ingest.decoded += 1;
                self.now_ns = self.now_ns.max(sample.time_ns());
                self.events.record(sample.event_type());
                self.analysis.ingest(&sample);
                true
            }
            Err(e) => {
                self.ingest.decode_errors += 1;
                if let Some(health) = &self.health {
                    health.decode_errors.with_label_values(&[e.as_label()]).inc();
                    health.samples_dropped.inc();
                }
                debug!(error = %e, "dropping sample");
                false
            }
        }
    }

    /// Run one report cycle.
    pub fn tick(&mut self) {
        if self.finished {
            return;
        }
        self.cycle(false);
    }

    /// Geometry changed: re-check layout and redraw now.
    pub fn resize(&mut self, geometry: Geometry) {
        self.geometry = geometry;
        self.analysis.resize(&self.geometry);
        self.tick();
    }

    /// Final report. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.cycle(true);
        self.finished = true;

        info!(
            received = self.ingest.received,
            decoded = self.ingest.decoded,
            decode_errors = self.ingest.decode_errors,
            cycles = self.ingest.cycles,
            "session finished"
        );
    }

    /// Feed records from `source` until it ends or `cancel` fires, reporting
    /// every `interval`. Shuts the session down before returning.
    pub async fn run<S>(&mut self, source: S, interval: Duration, cancel: CancellationToken) -> IngestStats
    where
        S: SampleSource + 'static,
    {
        let reader_cancel = cancel.child_token();
        let mut records = tracer::spawn_reader(source, READ_QUEUE, reader_cancel.clone());

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping session");
                    break;
                }
                _ = ticker.tick() => self.tick(),
                record = records.recv() => match record {
                    Some(raw) => {
                        self.process(&raw);
                    }
                    None => break,
                },
            }
        }

        reader_cancel.cancel();
        self.shutdown();
        self.ingest
    }

    pub fn analysis(&self) -> &dyn Analysis {
        self.analysis.as_ref()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.ingest
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Latest sample timestamp seen.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn cycle(&mut self, last: bool) {
        let started = Instant::now();

        self.frame.clear();
        if last {
            self.analysis.finish(self.now_ns, &self.geometry, &mut self.frame);
        } else {
            self.analysis.report(self.now_ns, &self.geometry, &mut self.frame);
        }
        self.ingest.cycles += 1;

        if !self.frame.is_empty() {
            if let Err(e) = self.sink.emit(&self.frame) {
                debug!(error = %e, "render output dropped");
            }
        }

        self.publish(started.elapsed());
    }

    fn publish(&mut self, elapsed: Duration) {
        let counts = self.events.snapshot();
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        debug!(samples = total, cycle = self.ingest.cycles, "report cycle");

        let stats = self.analysis.stats();
        let Some(health) = &self.health else {
            self.published = stats;
            return;
        };

        for (event, n) in &counts {
            let name = self
                .decoder
                .schema(*event)
                .map_or("unknown", |s| s.name.as_str());
            debug!(event = name, count = n, "event samples");
            health
                .samples_by_event
                .with_label_values(&[name])
                .inc_by(*n as f64);
        }

        health.report_cycles.inc();
        health.report_duration.observe(elapsed.as_secs_f64());

        if self.analysis.name() == "correlate" {
            health.pending_entries.set(stats.entries as f64);
        } else {
            health.table_entries.set(stats.entries as f64);
        }

        let prev = self.published;
        health
            .pairs_matched
            .inc_by(stats.matched.saturating_sub(prev.matched) as f64);
        health
            .pending_expired
            .inc_by(stats.expired.saturating_sub(prev.expired) as f64);
        health
            .pending_evicted
            .inc_by(stats.evicted.saturating_sub(prev.evicted) as f64);

        self.published = stats;
    }
}

/// Build the analysis selected by `cfg.mode`.
pub fn build_analysis(
    cfg: &Config,
    decoder: &SchemaDecoder,
    geometry: &Geometry,
) -> Result<Box<dyn Analysis>> {
    let agg = &cfg.aggregate;
    let key_name = cfg.key_label().to_string();

    let analysis: Box<dyn Analysis> = match cfg.mode {
        Mode::Aggregate => match agg.accumulator {
            kind @ (AccumulatorKind::Counter | AccumulatorKind::Vector) => Box::new(Top::new(
                kind,
                &agg.columns,
                &agg.rank_fields,
                decoder,
                TopOptions {
                    key_name,
                    show_comm: agg.show_comm,
                    only_comm: agg.only_comm,
                },
            )?),
            AccumulatorKind::Histogram => {
                let (period, size) = cfg.histogram_shape();
                Box::new(HrCount::new(
                    &agg.events,
                    HrCountOptions {
                        period_ns: u64::try_from(period.as_nanos()).unwrap_or(u64::MAX),
                        histogram_size: size,
                        value_field: agg.value_field.clone(),
                        key_name,
                    },
                    decoder,
                    geometry,
                )?)
            }
            AccumulatorKind::Diff => Box::new(Stat::new(
                &agg.events,
                agg.value_field.as_deref(),
                &agg.rank_fields,
                &key_name,
                decoder,
            )?),
        },
        Mode::Correlate => Box::new(build_correlation(&cfg.correlate, decoder)?),
        Mode::Trace => Box::new(TracePrinter::new(cfg.trace.max_lines)),
    };

    Ok(analysis)
}

/// Declare every configured pair on a fresh correlation class.
pub fn build_correlation(corr: &CorrelateConfig, decoder: &SchemaDecoder) -> Result<CorrelationClass> {
    let mut class = CorrelationClass::with_timeline_capacity(corr.timeline_capacity);
    for schema in decoder.schemas() {
        class.name_event(schema.id, schema.name.clone());
    }

    for pair in &corr.pairs {
        let label = format!("{} -> {}", pair.first, pair.second);
        let (first, second) = decoder
            .check_pair_keys(&pair.first, &pair.second)
            .with_context(|| format!("pair {label}"))?;
        let first_schema = decoder.lookup(&pair.first)?;
        let second_schema = decoder.lookup(&pair.second)?;

        let name = pair.strategy.as_deref().unwrap_or(&corr.strategy);
        let options = StrategyOptions {
            greater_than_ns: corr.greater_than_ns,
            first_n: corr.first_n,
            per_key: corr.per_key,
            bytes_field: first_schema.field_index(&corr.bytes_field),
            id_field: first_schema.field_index(&corr.id_field),
            ret_field: second_schema.field_index(&corr.ret_field),
        };
        if matches!(name, "mem-profile" | "kmemprof") && options.bytes_field.is_none() {
            warn!(pair = %label, field = %corr.bytes_field, "allocation size field missing, bytes will read as zero");
        }

        let strategy = strategy::build(name, &options).with_context(|| format!("pair {label}"))?;
        class
            .declare_pair(
                first,
                second,
                strategy,
                ObjectOptions {
                    window_ns: corr.window_ns,
                    max_pending: corr.max_pending,
                    duplicate: corr.duplicate,
                },
            )
            .with_context(|| format!("pair {label}"))?;
    }

    Ok(class)
}
