use super::{
    CorrelationStrategy, MatchInfo, PrintContext, Remaining, RemainingReason, StrategyOptions,
};
use crate::aggregate::latency::{format_us, LatencyStats, BUCKET_LABELS};
use crate::aggregate::rank::RankOrder;
use crate::aggregate::report::{Frame, ReportCycle};
use crate::aggregate::table::KeyedTable;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::Sample;

/// Samples printed around one slow pair before eliding the rest.
const MAX_CONTEXT: usize = 16;

/// Latency between the two events of a pair.
pub struct Delay {
    options: StrategyOptions,
    totals: LatencyStats,
    per_key: KeyedTable<u64, LatencyStats>,
    order: RankOrder,
    cycle: ReportCycle,
    outliers: Vec<String>,
    outliers_seen: usize,
    expired: u64,
}

impl Delay {
    pub fn new(options: StrategyOptions) -> Self {
        Self {
            options,
            totals: LatencyStats::new(),
            per_key: KeyedTable::new(LatencyStats::new),
            // calls, total(ns); ranked by total
            order: RankOrder::new(2, &[1]),
            cycle: ReportCycle::new(),
            outliers: Vec::new(),
            outliers_seen: 0,
            expired: 0,
        }
    }

    pub fn totals(&self) -> &LatencyStats {
        &self.totals
    }

    /// Fold one latency in. Shared with composed strategies.
    pub(crate) fn record(&mut self, key: u64, latency_ns: u64) {
        self.totals.record(latency_ns);
        if self.options.per_key {
            self.per_key.upsert(key, |s| s.record(latency_ns));
        }
    }

    fn record_outlier(&mut self, second: &Sample, info: &MatchInfo, latency_ns: u64, window: Option<&mut EventWindow<'_>>) {
        self.outliers_seen += 1;
        if self.options.capped(self.outliers.len()) {
            return;
        }
        self.outliers.push(format!(
            "  > key {} took {}us",
            info.key,
            format_us(latency_ns as f64)
        ));

        let Some(window) = window else {
            self.outliers.push(format!("    {second}"));
            return;
        };
        window.reset();
        if let Some(before) = window.prev() {
            self.outliers.push(format!("    - {before}"));
        }
        window.reset();
        let mut shown = 0;
        let mut elided = 0;
        while let Some(s) = window.next() {
            if shown < MAX_CONTEXT {
                self.outliers.push(format!("    | {s}"));
                shown += 1;
            } else {
                elided += 1;
            }
        }
        if elided > 0 {
            self.outliers.push(format!("    ... {elided} more"));
        }
    }
}

impl CorrelationStrategy for Delay {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn two(
        &mut self,
        _first: Option<&PendingEvent>,
        second: &Sample,
        info: &MatchInfo,
        window: Option<&mut EventWindow<'_>>,
    ) {
        let Some(latency_ns) = info.latency_ns else {
            return;
        };
        self.record(info.key, latency_ns);
        if self.options.greater_than_ns.is_some_and(|gt| latency_ns > gt) {
            self.record_outlier(second, info, latency_ns, window);
        }
    }

    fn remaining(&mut self, _pending: &PendingEvent, _now_ns: u64, reason: RemainingReason) -> Remaining {
        if reason == RemainingReason::Expired {
            self.expired += 1;
        }
        Remaining::Break
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        let first = if self.options.per_key { "KEY" } else { "PAIR" };
        frame.push(format!(
            "[{}] {:<24} {:>10} {:>14} {:>12} {:>12} {:>12}",
            ctx.id, first, "calls", "total(us)", "min(us)", "avg(us)", "max(us)"
        ));
    }

    fn print(&mut self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        let id = ctx.id;
        push_row(frame, id, &ctx.label(), &self.totals);

        if self.options.per_key {
            let order = &self.order;
            let first_n = self.options.first_n;
            let mut printed = 0usize;
            self.cycle.run(
                &mut self.per_key,
                |ka, a, kb, b| order.compare_keyed(ka, &[a.count(), a.sum()], kb, &[b.count(), b.sum()]),
                |key, stats| {
                    if first_n == 0 || printed < first_n {
                        push_row(frame, id, &key.to_string(), stats);
                        printed += 1;
                    }
                },
            );
        }

        if self.totals.count() > 0 {
            let mut line = String::from("    latency:");
            for (label, n) in BUCKET_LABELS.iter().zip(self.totals.buckets()) {
                if *n > 0 {
                    line.push_str(&format!(" {label}:{n}"));
                }
            }
            frame.push(line);
        }

        if self.outliers_seen > 0 {
            frame.push(format!(
                "    slower than {}us: {}",
                format_us(self.options.greater_than_ns.unwrap_or(0) as f64),
                self.outliers_seen
            ));
            for line in self.outliers.drain(..) {
                frame.push(line);
            }
        }
        if self.expired > 0 {
            frame.push(format!("    expired: {}", self.expired));
        }

        self.totals.reset();
        self.outliers_seen = 0;
        self.expired = 0;
    }

    fn needs_window(&self) -> bool {
        self.options.greater_than_ns.is_some()
    }
}

fn push_row(frame: &mut Frame, id: impl std::fmt::Display, label: &str, stats: &LatencyStats) {
    frame.push(format!(
        "[{}] {:<24} {:>10} {:>14} {:>12} {:>12} {:>12}",
        id,
        label,
        stats.count(),
        format_us(stats.sum() as f64),
        format_us(stats.min() as f64),
        format_us(stats.avg()),
        format_us(stats.max() as f64),
    ));
}
