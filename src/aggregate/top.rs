//! Ranked per-key counters, refreshed every report cycle.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::accumulator::{AccumulatorKind, CounterVector};
use super::rank::RankOrder;
use super::report::{Frame, Geometry, ReportCycle};
use super::table::KeyedTable;
use crate::session::{Analysis, AnalysisStats};
use crate::tracer::event::{Comm, EventTypeId, Sample};
use crate::tracer::parse::SchemaDecoder;

/// Minimum width of a value column.
const FIELD_WIDTH: usize = 12;
/// Minimum width of the key column.
const KEY_WIDTH: usize = 8;
/// Keys at or above this print as hex.
const HEX_KEY_THRESHOLD: u64 = 100_000_000;
/// Title, header and a spare line.
const RESERVED_ROWS: usize = 3;

/// One report column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnSpec {
    /// Column header.
    pub name: String,
    /// Only samples of this event feed the column. All events when absent.
    #[serde(default)]
    pub event: Option<String>,
    /// Field summed into the column. Occurrences are counted when absent.
    #[serde(default)]
    pub field: Option<String>,
}

impl ColumnSpec {
    pub fn count(name: &str) -> Self {
        Self {
            name: name.to_string(),
            event: None,
            field: None,
        }
    }
}

/// Row key: the sample key plus an optional comm label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TopKey {
    pub key: u64,
    pub comm: Comm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnSource {
    Count,
    Field(usize),
}

/// Display options for [`Top`].
#[derive(Debug, Clone, Default)]
pub struct TopOptions {
    /// Header of the key column.
    pub key_name: String,
    /// Group by comm and print it.
    pub show_comm: bool,
    /// Collapse the key and group by comm only.
    pub only_comm: bool,
}

/// Counter or counter-vector aggregation ranked by configured columns.
pub struct Top {
    columns: Vec<String>,
    sources: HashMap<EventTypeId, Vec<(usize, ColumnSource)>>,
    order: RankOrder,
    table: KeyedTable<TopKey, CounterVector>,
    cycle: ReportCycle,
    options: TopOptions,
    key_width: usize,
    widths: Vec<usize>,
    samples: u64,
    skipped: u64,
}

impl Top {
    pub fn new(
        kind: AccumulatorKind,
        columns: &[ColumnSpec],
        rank_fields: &[String],
        decoder: &SchemaDecoder,
        options: TopOptions,
    ) -> Result<Self> {
        let columns: Vec<ColumnSpec> = match kind {
            AccumulatorKind::Counter if columns.is_empty() => vec![ColumnSpec::count("count")],
            AccumulatorKind::Counter => columns
                .iter()
                .map(|c| ColumnSpec {
                    field: None,
                    ..c.clone()
                })
                .collect(),
            AccumulatorKind::Vector if columns.is_empty() => {
                bail!("vector accumulator needs at least one column")
            }
            AccumulatorKind::Vector => columns.to_vec(),
            other => bail!("{} accumulator is not a top aggregation", other.as_str()),
        };

        let mut sources: HashMap<EventTypeId, Vec<(usize, ColumnSource)>> = HashMap::new();
        for (idx, col) in columns.iter().enumerate() {
            let targets = match &col.event {
                Some(name) => vec![decoder
                    .lookup(name)
                    .with_context(|| format!("column {}", col.name))?],
                None => decoder.schemas(),
            };

            for schema in targets {
                let source = match &col.field {
                    None => ColumnSource::Count,
                    Some(field) => match schema.field_index(field) {
                        Some(i) => ColumnSource::Field(i),
                        None if col.event.is_some() => {
                            bail!("column {}: event {} has no field {field}", col.name, schema.name)
                        }
                        None => continue,
                    },
                };
                sources.entry(schema.id).or_default().push((idx, source));
            }
        }

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let order = RankOrder::from_names(&names, rank_fields).context("resolving rank fields")?;
        let widths = names.iter().map(|n| n.len().max(FIELD_WIDTH)).collect();
        let key_width = options.key_name.len().max(KEY_WIDTH);
        let n = names.len();

        Ok(Self {
            columns: names,
            sources,
            order,
            table: KeyedTable::new(move || CounterVector::new(n)),
            cycle: ReportCycle::new(),
            options,
            key_width,
            widths,
            samples: 0,
            skipped: 0,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Samples ignored because they carry no usable thread id.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Drain the table in report order without rendering.
    pub fn drain_sorted(&mut self) -> Vec<(TopKey, CounterVector)> {
        let order = &self.order;
        self.samples = 0;
        self.table
            .drain_sorted(|ka, a, kb, b| order.compare_keyed(ka, a.values(), kb, b.values()))
    }

    fn header(&self) -> String {
        let mut line = String::new();
        if !self.options.only_comm {
            line.push_str(&format!("{:>w$}", self.options.key_name, w = self.key_width));
        }
        for (name, w) in self.columns.iter().zip(&self.widths) {
            line.push_str(&format!(" {name:>w$}"));
        }
        if self.options.show_comm || self.options.only_comm {
            line.push_str(" COMM");
        }
        line
    }
}

/// Decimal below 100,000,000, hex above.
pub fn format_key(key: u64) -> String {
    if key < HEX_KEY_THRESHOLD {
        key.to_string()
    } else {
        format!("0x{key:x}")
    }
}

impl Analysis for Top {
    fn name(&self) -> &'static str {
        "top"
    }

    fn ingest(&mut self, sample: &Sample) {
        if sample.header.tid == u32::MAX {
            self.skipped += 1;
            return;
        }
        let Some(sources) = self.sources.get(&sample.event_type()) else {
            return;
        };

        let key = TopKey {
            key: if self.options.only_comm { 0 } else { sample.key },
            comm: if self.options.show_comm || self.options.only_comm {
                sample.header.comm
            } else {
                Comm::default()
            },
        };

        self.table.upsert(key, |row| {
            for (idx, source) in sources {
                let value = match source {
                    ColumnSource::Count => 1,
                    ColumnSource::Field(i) => sample.fields.value(*i).unwrap_or(0),
                };
                row.add(*idx, value);
            }
        });
        self.samples += 1;
    }

    fn report(&mut self, _now_ns: u64, geometry: &Geometry, frame: &mut Frame) {
        frame.push(format!(
            "{} sample {} events",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.samples
        ));
        frame.push(self.header());

        let limit = geometry.body_rows(RESERVED_ROWS).unwrap_or(usize::MAX);
        let order = &self.order;
        let options = &self.options;
        let widths = &self.widths;
        let key_width = self.key_width;
        let mut rendered = 0usize;

        self.cycle.run(
            &mut self.table,
            |ka, a, kb, b| order.compare_keyed(ka, a.values(), kb, b.values()),
            |k, row| {
                if rendered >= limit {
                    return;
                }
                rendered += 1;

                let mut line = String::new();
                if !options.only_comm {
                    line.push_str(&format!("{:>w$}", format_key(k.key), w = key_width));
                }
                for (v, w) in row.values().iter().zip(widths) {
                    line.push_str(&format!(" {v:>w$}"));
                }
                if options.show_comm || options.only_comm {
                    line.push_str(&format!(" {}", k.comm));
                }
                frame.push(line);
            },
        );
        self.samples = 0;
    }

    fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            entries: self.table.len(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::EventDef;
    use crate::tracer::parse::{encode_record, Decoder};

    fn decoder() -> SchemaDecoder {
        let events = vec![
            EventDef {
                name: "sched_wakeup".to_string(),
                id: 1,
                fields: vec!["prio".to_string()],
                key: None,
            },
            EventDef {
                name: "block_rq".to_string(),
                id: 2,
                fields: vec!["bytes".to_string()],
                key: None,
            },
        ];
        SchemaDecoder::new(&events, Some("pid")).expect("schema")
    }

    fn sample(decoder: &SchemaDecoder, event: u16, pid: u32, comm: &[u8], value: u64) -> Sample {
        let mut raw = Vec::new();
        encode_record(&mut raw, 1, pid, pid, 0, event, comm, &[value]);
        decoder.decode(&raw).expect("decode")
    }

    fn options() -> TopOptions {
        TopOptions {
            key_name: "PID".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_counter_ranks_by_count() {
        let decoder = decoder();
        let mut top = Top::new(
            AccumulatorKind::Counter,
            &[],
            &["count".to_string()],
            &decoder,
            options(),
        )
        .expect("top");

        for pid in [5, 7, 5] {
            top.ingest(&sample(&decoder, 1, pid, b"a", 0));
        }

        let rows: Vec<(u64, u64)> = top
            .drain_sorted()
            .into_iter()
            .map(|(k, r)| (k.key, r.get(0)))
            .collect();
        assert_eq!(rows, vec![(5, 2), (7, 1)]);
    }

    #[test]
    fn test_vector_sums_fields_per_event() {
        let decoder = decoder();
        let columns = vec![
            ColumnSpec {
                name: "wakeups".to_string(),
                event: Some("sched_wakeup".to_string()),
                field: None,
            },
            ColumnSpec {
                name: "bytes".to_string(),
                event: Some("block_rq".to_string()),
                field: Some("bytes".to_string()),
            },
        ];
        let mut top = Top::new(
            AccumulatorKind::Vector,
            &columns,
            &["bytes".to_string()],
            &decoder,
            options(),
        )
        .expect("top");

        top.ingest(&sample(&decoder, 1, 10, b"a", 0));
        top.ingest(&sample(&decoder, 1, 10, b"a", 0));
        top.ingest(&sample(&decoder, 2, 10, b"a", 4096));
        top.ingest(&sample(&decoder, 2, 11, b"b", 8192));

        let rows: Vec<(u64, Vec<u64>)> = top
            .drain_sorted()
            .into_iter()
            .map(|(k, r)| (k.key, r.values().to_vec()))
            .collect();
        assert_eq!(rows, vec![(11, vec![0, 8192]), (10, vec![2, 4096])]);
    }

    #[test]
    fn test_unknown_rank_field_is_rejected() {
        let decoder = decoder();
        let err = Top::new(
            AccumulatorKind::Counter,
            &[],
            &["latency".to_string()],
            &decoder,
            options(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_field_on_explicit_event_is_rejected() {
        let decoder = decoder();
        let columns = vec![ColumnSpec {
            name: "x".to_string(),
            event: Some("sched_wakeup".to_string()),
            field: Some("bytes".to_string()),
        }];
        assert!(Top::new(AccumulatorKind::Vector, &columns, &[], &decoder, options()).is_err());
    }

    #[test]
    fn test_only_comm_groups_by_comm() {
        let decoder = decoder();
        let mut top = Top::new(
            AccumulatorKind::Counter,
            &[],
            &[],
            &decoder,
            TopOptions {
                only_comm: true,
                ..options()
            },
        )
        .expect("top");

        top.ingest(&sample(&decoder, 1, 1, b"nginx", 0));
        top.ingest(&sample(&decoder, 1, 2, b"nginx", 0));
        top.ingest(&sample(&decoder, 1, 3, b"bash", 0));

        let rows: Vec<(String, u64)> = top
            .drain_sorted()
            .into_iter()
            .map(|(k, r)| (k.comm.to_string(), r.get(0)))
            .collect();
        assert_eq!(
            rows,
            vec![("nginx".to_string(), 2), ("bash".to_string(), 1)]
        );
    }

    #[test]
    fn test_report_renders_and_resets() {
        let decoder = decoder();
        let mut top = Top::new(
            AccumulatorKind::Counter,
            &[],
            &["count".to_string()],
            &decoder,
            options(),
        )
        .expect("top");
        top.ingest(&sample(&decoder, 1, 5, b"a", 0));
        top.ingest(&sample(&decoder, 1, 200_000_000, b"a", 0));
        top.ingest(&sample(&decoder, 1, 200_000_000, b"a", 0));

        let mut frame = Frame::new();
        top.report(0, &Geometry::default(), &mut frame);
        let texts = frame.texts();

        assert!(texts[0].ends_with("sample 3 events"));
        assert_eq!(texts[1], format!("{:>8} {:>12}", "PID", "count"));
        assert_eq!(texts[2], format!("{:>8} {:>12}", "0xbebc200", 2));
        assert_eq!(texts[3], format!("{:>8} {:>12}", 5, 1));
        assert_eq!(top.stats().entries, 0);
    }

    #[test]
    fn test_report_limits_rows_on_tty() {
        let decoder = decoder();
        let mut top =
            Top::new(AccumulatorKind::Counter, &[], &[], &decoder, options()).expect("top");
        for pid in 0..10 {
            top.ingest(&sample(&decoder, 1, pid, b"a", 0));
        }
        let geometry = Geometry {
            cols: Some(80),
            rows: Some(6),
            tty: true,
        };
        let mut frame = Frame::new();
        top.report(0, &geometry, &mut frame);
        assert_eq!(frame.len(), 2 + 3);
    }

    #[test]
    fn test_idle_thread_is_skipped() {
        let decoder = decoder();
        let mut top =
            Top::new(AccumulatorKind::Counter, &[], &[], &decoder, options()).expect("top");
        top.ingest(&sample(&decoder, 1, u32::MAX, b"swapper", 0));
        assert_eq!(top.skipped(), 1);
        assert!(top.drain_sorted().is_empty());
    }

    #[test]
    fn test_format_key() {
        assert_eq!(format_key(99_999_999), "99999999");
        assert_eq!(format_key(0xffff_8880_0000_0000), "0xffff888000000000");
    }
}
