use super::{
    CorrelationStrategy, MatchInfo, PrintContext, Remaining, RemainingReason, StrategyOptions,
    SweepPolicy,
};
use crate::aggregate::accumulator::CounterVector;
use crate::aggregate::rank::RankOrder;
use crate::aggregate::report::{Frame, ReportCycle};
use crate::aggregate::table::KeyedTable;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::{Comm, Sample};

const ALLOCS: usize = 0;
const ALLOC_BYTES: usize = 1;
const FREES: usize = 2;
const FREE_BYTES: usize = 3;
const IN_USE: usize = 4;
const IN_USE_BYTES: usize = 5;
const COLUMNS: usize = 6;

/// Allocation profile per allocating task. The first event is the
/// allocation keyed by address, the second the matching free.
pub struct MemProfile {
    options: StrategyOptions,
    table: KeyedTable<Comm, CounterVector>,
    order: RankOrder,
    cycle: ReportCycle,
    unknown_frees: u64,
    evicted: u64,
}

impl MemProfile {
    pub fn new(options: StrategyOptions) -> Self {
        Self {
            options,
            table: KeyedTable::new(|| CounterVector::new(COLUMNS)),
            order: RankOrder::new(COLUMNS, &[IN_USE_BYTES, ALLOC_BYTES]),
            cycle: ReportCycle::new(),
            unknown_frees: 0,
            evicted: 0,
        }
    }

    fn bytes(&self, event: &PendingEvent) -> u64 {
        self.options
            .bytes_field
            .and_then(|i| event.sample.fields.value(i))
            .unwrap_or(0)
    }
}

impl CorrelationStrategy for MemProfile {
    fn name(&self) -> &'static str {
        "mem-profile"
    }

    fn one(&mut self, first: &PendingEvent) {
        let bytes = self.bytes(first);
        self.table.upsert(first.sample.header.comm, |row| {
            row.add(ALLOCS, 1);
            row.add(ALLOC_BYTES, bytes);
        });
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        _second: &Sample,
        _info: &MatchInfo,
        _window: Option<&mut EventWindow<'_>>,
    ) {
        let Some(first) = first else {
            self.unknown_frees += 1;
            return;
        };
        let bytes = self.bytes(first);
        self.table.upsert(first.sample.header.comm, |row| {
            row.add(FREES, 1);
            row.add(FREE_BYTES, bytes);
        });
    }

    /// Outstanding allocations stay pending and are tallied as in use.
    fn remaining(&mut self, pending: &PendingEvent, _now_ns: u64, reason: RemainingReason) -> Remaining {
        if reason == RemainingReason::Evicted {
            self.evicted += 1;
            return Remaining::Break;
        }
        let bytes = self.bytes(pending);
        self.table.upsert(pending.sample.header.comm, |row| {
            row.add(IN_USE, 1);
            row.add(IN_USE_BYTES, bytes);
        });
        Remaining::Continue
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!("[{}] {} (mem-profile)", ctx.id, ctx.label()));
        frame.push(format!(
            "{:<16} {:>10} {:>14} {:>10} {:>14} {:>10} {:>14}",
            "COMM", "allocs", "alloc_bytes", "frees", "free_bytes", "in_use", "in_use_bytes"
        ));
    }

    fn print(&mut self, _ctx: &PrintContext<'_>, frame: &mut Frame) {
        let order = &self.order;
        let first_n = self.options.first_n;
        let mut printed = 0usize;
        let mut hidden = 0usize;
        self.cycle.run(
            &mut self.table,
            |ka, a, kb, b| order.compare_keyed(ka, a.values(), kb, b.values()),
            |comm, row| {
                if first_n != 0 && printed >= first_n {
                    hidden += 1;
                    return;
                }
                printed += 1;
                frame.push(format!(
                    "{:<16} {:>10} {:>14} {:>10} {:>14} {:>10} {:>14}",
                    comm,
                    row.get(ALLOCS),
                    row.get(ALLOC_BYTES),
                    row.get(FREES),
                    row.get(FREE_BYTES),
                    row.get(IN_USE),
                    row.get(IN_USE_BYTES),
                ));
            },
        );
        if hidden > 0 {
            frame.push(format!("  ... {hidden} more"));
        }
        if self.unknown_frees > 0 {
            frame.push(format!("  unknown frees: {}", self.unknown_frees));
        }
        if self.evicted > 0 {
            frame.push(format!("  evicted allocations: {}", self.evicted));
        }
        self.unknown_frees = 0;
        self.evicted = 0;
    }

    fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy::All
    }
}
