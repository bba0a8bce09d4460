//! High-resolution counting: per-key time histograms within each cycle.
//!
//! Each report interval is split into `histogram_size` buckets of
//! `period` nanoseconds. A sample lands in the bucket matching its offset
//! from the first sample of the cycle. Output uses the packed layout
//! (every event of a key on one line) when it fits, else one line per
//! key and event.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use super::accumulator::HistogramRow;
use super::report::{ColumnWidth, Frame, Geometry, Layout, LayoutState, ReportCycle};
use super::table::KeyedTable;
use crate::session::{Analysis, AnalysisStats};
use crate::tracer::event::{EventTypeId, Sample};
use crate::tracer::parse::SchemaDecoder;

/// Packed layout is only attempted up to this many buckets.
pub const MAX_PACKED_BUCKETS: usize = 5;
/// Initial width of a single bucket value.
const MIN_COUNTER_WIDTH: usize = 2;
const KEY_WIDTH: usize = 8;

#[derive(Debug, Clone)]
pub struct HrCountOptions {
    /// Bucket width in nanoseconds.
    pub period_ns: u64,
    /// Buckets per histogram.
    pub histogram_size: usize,
    /// Field added per sample. Occurrences are counted when absent.
    pub value_field: Option<String>,
    /// Header of the key column.
    pub key_name: String,
}

pub struct HrCount {
    names: Vec<String>,
    column_of: HashMap<EventTypeId, (usize, Option<usize>)>,
    period_ns: u64,
    table: KeyedTable<u64, HistogramRow>,
    cycle: ReportCycle,
    layout: LayoutState,
    counter_width: ColumnWidth,
    column_widths: Vec<ColumnWidth>,
    key_name: String,
    key_width: usize,
    name_width: usize,
    cycle_start: Option<u64>,
    size: usize,
}

impl HrCount {
    /// `events` selects and orders the columns; empty means every event.
    pub fn new(
        events: &[String],
        options: HrCountOptions,
        decoder: &SchemaDecoder,
        geometry: &Geometry,
    ) -> Result<Self> {
        if options.period_ns == 0 {
            bail!("hrcount period must be positive");
        }
        if options.histogram_size == 0 {
            bail!("histogram_size must be positive");
        }

        let schemas = if events.is_empty() {
            decoder.schemas()
        } else {
            events
                .iter()
                .map(|name| decoder.lookup(name))
                .collect::<Result<Vec<_>, _>>()
                .context("resolving hrcount events")?
        };

        let mut names = Vec::with_capacity(schemas.len());
        let mut column_of = HashMap::new();
        for (idx, schema) in schemas.iter().enumerate() {
            let value = match &options.value_field {
                Some(field) => schema.field_index(field),
                None => None,
            };
            column_of.insert(schema.id, (idx, value));
            names.push(schema.name.clone());
        }

        let size = options.histogram_size;
        let n = names.len();
        let mut hr = Self {
            column_widths: names.iter().map(|n| ColumnWidth::new(n.len())).collect(),
            name_width: names.iter().map(String::len).max().unwrap_or(0),
            names,
            column_of,
            period_ns: options.period_ns,
            table: KeyedTable::new(move || HistogramRow::new(n, size)),
            cycle: ReportCycle::new(),
            layout: LayoutState::new(size <= MAX_PACKED_BUCKETS),
            counter_width: ColumnWidth::new(MIN_COUNTER_WIDTH),
            key_width: options.key_name.len().max(KEY_WIDTH),
            key_name: options.key_name,
            cycle_start: None,
            size,
        };
        hr.grow_columns();
        hr.layout.evaluate(hr.packed_width(), geometry);
        Ok(hr)
    }

    pub fn layout(&self) -> Layout {
        self.layout.current()
    }

    pub fn counter_width(&self) -> usize {
        self.counter_width.get()
    }

    /// Column width needed by `size` bucket values joined with '|'.
    fn grow_columns(&mut self) {
        let needed = self.size * (self.counter_width.get() + 1) - 1;
        for w in &mut self.column_widths {
            w.grow_to(needed);
        }
    }

    fn packed_width(&self) -> usize {
        self.key_width + self.column_widths.iter().map(|w| w.get() + 1).sum::<usize>()
    }
}

fn join_buckets(buckets: &[u64], width: usize) -> String {
    let mut out = String::new();
    for (i, v) in buckets.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        out.push_str(&format!("{v:>width$}"));
    }
    out
}

impl Analysis for HrCount {
    fn name(&self) -> &'static str {
        "hrcount"
    }

    fn ingest(&mut self, sample: &Sample) {
        let Some(&(column, value_idx)) = self.column_of.get(&sample.event_type()) else {
            return;
        };
        let start = *self.cycle_start.get_or_insert(sample.time_ns());
        let offset = (sample.time_ns().saturating_sub(start) / self.period_ns) as usize;
        let value = match value_idx {
            Some(i) => sample.fields.value(i).unwrap_or(0),
            None => 1,
        };

        self.table.upsert(sample.key, |row| {
            if let Some(h) = row.columns.get_mut(column) {
                h.insert(offset, value);
            }
        });
    }

    fn report(&mut self, _now_ns: u64, geometry: &Geometry, frame: &mut Frame) {
        let max = self.table.iter().map(|(_, r)| r.max()).max().unwrap_or(0);
        if self.counter_width.fit(max) {
            self.grow_columns();
        }

        let layout = self.layout.current();
        let cw = self.counter_width.get();
        let kw = self.key_width;
        let names = &self.names;
        let widths = &self.column_widths;
        let name_width = self.name_width;
        let mut overflow = false;

        if layout == Layout::Packed {
            let mut header = format!("{:>kw$}", self.key_name);
            for (name, w) in names.iter().zip(widths) {
                header.push_str(&format!(" {name:<w$}", w = w.get()));
            }
            frame.push(header);
        }

        self.cycle.run(
            &mut self.table,
            |_, _, _, _| Ordering::Equal,
            |key, row| match layout {
                Layout::Packed => {
                    let mut line = format!("{key:>kw$}");
                    for (h, w) in row.columns.iter().zip(widths) {
                        line.push_str(&format!(" {:<w$}", join_buckets(h.buckets(), cw), w = w.get()));
                    }
                    let width = line.chars().count();
                    if !geometry.fits(width) {
                        overflow = true;
                    }
                    frame.push(line);
                }
                Layout::Direct => {
                    for (name, h) in names.iter().zip(&row.columns) {
                        frame.push(format!(
                            "{key:>kw$} {name:<name_width$} {}",
                            join_buckets(h.buckets(), cw)
                        ));
                    }
                }
            },
        );

        if overflow {
            tracing::debug!("packed hrcount line wider than output, switching to direct");
            self.layout.note_overflow();
        }
        self.layout.end_cycle();
        self.cycle_start = None;
    }

    fn resize(&mut self, geometry: &Geometry) {
        self.layout.evaluate(self.packed_width(), geometry);
    }

    fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            entries: self.table.len(),
            ..Default::default()
        }
    }
}
