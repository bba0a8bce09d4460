//! Report cycle plumbing: rendered lines, sinks, geometry and layout.

use std::cmp::Ordering;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::accumulator::{Accumulator, CarryPolicy};
use super::table::KeyedTable;

/// One pre-formatted output line tagged with its logical column width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderLine {
    pub text: String,
    pub width: usize,
}

impl RenderLine {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let width = text.chars().count();
        Self { text, width }
    }
}

/// Lines produced by one report cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    lines: Vec<RenderLine>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.lines.push(RenderLine::new(text));
    }

    pub fn push_line(&mut self, line: RenderLine) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[RenderLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn max_width(&self) -> usize {
        self.lines.iter().map(|l| l.width).max().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Texts only, mostly for assertions.
    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }
}

/// Destination for rendered frames. Writes are best effort.
pub trait RenderSink: Send {
    fn emit(&mut self, frame: &Frame) -> io::Result<()>;
}

/// Writes every line of a frame to an `io::Write`.
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> RenderSink for WriterSink<W> {
    fn emit(&mut self, frame: &Frame) -> io::Result<()> {
        for line in frame.lines() {
            self.writer.write_all(line.text.as_bytes())?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// Keeps emitted frames in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// All emitted lines, flattened across frames.
    pub fn lines(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .flat_map(|f| f.lines().iter().map(|l| l.text.clone()))
            .collect()
    }
}

impl RenderSink for CaptureSink {
    fn emit(&mut self, frame: &Frame) -> io::Result<()> {
        self.frames.lock().push(frame.clone());
        Ok(())
    }
}

/// Output geometry. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub cols: Option<usize>,
    pub rows: Option<usize>,
    pub tty: bool,
}

impl Geometry {
    pub fn fits(&self, width: usize) -> bool {
        self.cols.map_or(true, |c| width <= c)
    }

    /// Rows available for table body lines after `reserved` header lines.
    pub fn body_rows(&self, reserved: usize) -> Option<usize> {
        match (self.tty, self.rows) {
            (true, Some(rows)) => Some(rows.saturating_sub(reserved)),
            _ => None,
        }
    }
}

/// Number of decimal digits in `v`.
pub fn digits(v: u64) -> usize {
    v.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Column width that only ever grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnWidth(usize);

impl ColumnWidth {
    pub fn new(initial: usize) -> Self {
        Self(initial)
    }

    /// Widen to `width` if larger. Returns true when the width changed.
    pub fn grow_to(&mut self, width: usize) -> bool {
        if width > self.0 {
            self.0 = width;
            true
        } else {
            false
        }
    }

    /// Widen to fit a value.
    pub fn fit(&mut self, value: u64) -> bool {
        self.grow_to(digits(value))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// Histogram render layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One (key, column) histogram per line.
    Direct,
    /// Every column of a key on one line.
    Packed,
}

/// Packed/direct state machine.
///
/// Packed is chosen only when preferred and the header fits. An overflow
/// seen while rendering packed takes effect at the end of that cycle and
/// holds until the geometry changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutState {
    current: Layout,
    prefer_packed: bool,
    overflowed: bool,
}

impl LayoutState {
    pub fn new(prefer_packed: bool) -> Self {
        Self {
            current: if prefer_packed {
                Layout::Packed
            } else {
                Layout::Direct
            },
            prefer_packed,
            overflowed: false,
        }
    }

    /// Re-run the width check, e.g. after a geometry change.
    pub fn evaluate(&mut self, needed_width: usize, geometry: &Geometry) -> Layout {
        self.overflowed = false;
        self.current = if self.prefer_packed && geometry.fits(needed_width) {
            Layout::Packed
        } else {
            Layout::Direct
        };
        self.current
    }

    pub fn current(&self) -> Layout {
        self.current
    }

    /// Record that a packed line did not fit.
    pub fn note_overflow(&mut self) {
        if self.current == Layout::Packed {
            self.overflowed = true;
        }
    }

    /// Apply a pending overflow. Returns the layout for the next cycle.
    pub fn end_cycle(&mut self) -> Layout {
        if self.overflowed {
            self.overflowed = false;
            self.current = Layout::Direct;
        }
        self.current
    }
}

/// Periodic drain of a keyed table.
///
/// Records whose accumulator resets are drained out of the table; kept
/// records are read in place and then told they were reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportCycle {
    cycles: u64,
}

impl ReportCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Sort the table with `order`, render each row, then reset or carry.
    /// Returns the number of rows rendered.
    pub fn run<K, R, O, F>(&mut self, table: &mut KeyedTable<K, R>, mut order: O, mut render: F) -> usize
    where
        K: Ord,
        R: Accumulator,
        O: FnMut(&K, &R, &K, &R) -> Ordering,
        F: FnMut(&K, &R),
    {
        self.cycles += 1;
        match R::CARRY {
            CarryPolicy::Reset => {
                let rows = table.drain_sorted(order);
                for (k, r) in &rows {
                    render(k, r);
                }
                rows.len()
            }
            CarryPolicy::Keep => {
                let mut rows: Vec<(&K, &mut R)> = table.iter_mut().collect();
                rows.sort_by(|a, b| order(a.0, &*a.1, b.0, &*b.1));
                for (k, r) in rows.iter_mut() {
                    render(*k, &**r);
                    r.reported();
                }
                rows.len()
            }
        }
    }
}
