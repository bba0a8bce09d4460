//! Per-key diff counters: each cycle reports what changed since the last.

use std::collections::HashMap;

use anyhow::{Context, Result};

use super::accumulator::DiffRow;
use super::rank::RankOrder;
use super::report::{Frame, Geometry, ReportCycle};
use super::table::KeyedTable;
use crate::session::{Analysis, AnalysisStats};
use crate::tracer::event::{EventTypeId, Sample};
use crate::tracer::parse::SchemaDecoder;

const MIN_COLUMN_WIDTH: usize = 8;

/// Diff-counter aggregation. Rows are kept across cycles; only the
/// per-cycle delta is reported and re-zeroed.
pub struct Stat {
    names: Vec<String>,
    column_of: HashMap<EventTypeId, (usize, Option<usize>)>,
    order: RankOrder,
    table: KeyedTable<u64, DiffRow>,
    cycle: ReportCycle,
    key_name: String,
    widths: Vec<usize>,
}

impl Stat {
    /// `value_field` names a monotonically increasing raw counter. Events
    /// without it count occurrences instead.
    pub fn new(
        events: &[String],
        value_field: Option<&str>,
        rank_fields: &[String],
        key_name: &str,
        decoder: &SchemaDecoder,
    ) -> Result<Self> {
        let schemas = if events.is_empty() {
            decoder.schemas()
        } else {
            events
                .iter()
                .map(|name| decoder.lookup(name))
                .collect::<Result<Vec<_>, _>>()
                .context("resolving stat events")?
        };

        let mut names = Vec::with_capacity(schemas.len());
        let mut column_of = HashMap::new();
        for (idx, schema) in schemas.iter().enumerate() {
            let value = value_field.and_then(|f| schema.field_index(f));
            column_of.insert(schema.id, (idx, value));
            names.push(schema.name.clone());
        }

        let order = RankOrder::from_names(&names, rank_fields).context("resolving rank fields")?;
        let widths = names.iter().map(|n| n.len().max(MIN_COLUMN_WIDTH)).collect();
        let n = names.len();

        Ok(Self {
            names,
            column_of,
            order,
            table: KeyedTable::new(move || DiffRow::new(n)),
            cycle: ReportCycle::new(),
            key_name: key_name.to_string(),
            widths,
        })
    }

    /// Current delta of one key and column.
    pub fn delta(&self, key: u64, column: usize) -> Option<u64> {
        self.table.get(&key).map(|row| row.delta(column))
    }
}

impl Analysis for Stat {
    fn name(&self) -> &'static str {
        "stat"
    }

    fn ingest(&mut self, sample: &Sample) {
        let Some(&(column, value_idx)) = self.column_of.get(&sample.event_type()) else {
            return;
        };
        self.table.upsert(sample.key, |row| {
            if let Some(counter) = row.counters.get_mut(column) {
                match value_idx.and_then(|i| sample.fields.value(i)) {
                    Some(raw) => {
                        counter.update(raw);
                    }
                    None => counter.add(1),
                }
            }
        });
    }

    fn report(&mut self, _now_ns: u64, _geometry: &Geometry, frame: &mut Frame) {
        let mut header = format!("[{}]", self.key_name.to_uppercase());
        for (name, w) in self.names.iter().zip(&self.widths) {
            header.push_str(&format!(" {name:>w$}"));
        }
        frame.push(header);

        let order = &self.order;
        let widths = &self.widths;
        self.cycle.run(
            &mut self.table,
            |ka, a, kb, b| order.compare_with(|i| a.delta(i), |i| b.delta(i)).then(ka.cmp(kb)),
            |key, row| {
                let mut line = format!("[{key:03}]");
                for (i, w) in widths.iter().enumerate() {
                    line.push_str(&format!(" {:>w$}", row.delta(i)));
                }
                frame.push(line);
            },
        );
    }

    fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            entries: self.table.len(),
            ..Default::default()
        }
    }
}
