use std::collections::HashMap;

use super::{CorrelationStrategy, MatchInfo, PrintContext};
use crate::aggregate::accumulator::CounterVector;
use crate::aggregate::report::{Frame, ReportCycle};
use crate::aggregate::table::KeyedTable;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::{EventTypeId, Sample};

/// What a thread did between entering and leaving a call: the samples of
/// the same thread that occurred strictly between the pair, per event type.
pub struct Call {
    calls: u64,
    table: KeyedTable<EventTypeId, CounterVector>,
    names: HashMap<EventTypeId, String>,
    cycle: ReportCycle,
}

impl Call {
    pub fn new() -> Self {
        Self {
            calls: 0,
            table: KeyedTable::new(|| CounterVector::new(1)),
            names: HashMap::new(),
            cycle: ReportCycle::new(),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Intervening samples of `event` seen this cycle.
    pub fn count(&self, event: EventTypeId) -> u64 {
        self.table.get(&event).map_or(0, |r| r.get(0))
    }
}

impl Default for Call {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationStrategy for Call {
    fn name(&self) -> &'static str {
        "call"
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        second: &Sample,
        _info: &MatchInfo,
        window: Option<&mut EventWindow<'_>>,
    ) {
        if first.is_none() {
            return;
        }
        let Some(window) = window else {
            return;
        };
        self.calls += 1;
        let tid = second.header.tid;
        for s in window.between().filter(|s| s.header.tid == tid) {
            let event = s.event_type();
            if !self.names.contains_key(&event) {
                self.names.insert(event, s.event_name().to_string());
            }
            self.table.upsert(event, |row| row.add(0, 1));
        }
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!(
            "[{}] {} calls: {}",
            ctx.id,
            ctx.label(),
            self.calls
        ));
    }

    fn print(&mut self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        let calls = self.calls.max(1) as f64;
        let names = &self.names;
        let id = ctx.id;
        self.cycle.run(
            &mut self.table,
            |ka, a, kb, b| b.get(0).cmp(&a.get(0)).then(ka.cmp(kb)),
            |event, row| {
                let name = names.get(event).map_or("?", String::as_str);
                frame.push(format!(
                    "[{}]   {:<24} {:>10} {:>10.2}",
                    id,
                    name,
                    row.get(0),
                    row.get(0) as f64 / calls
                ));
            },
        );
        self.calls = 0;
    }

    fn needs_window(&self) -> bool {
        true
    }
}
