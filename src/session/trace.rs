use super::{Analysis, AnalysisStats};
use crate::aggregate::report::{Frame, Geometry};
use crate::tracer::event::Sample;

/// Prints every decoded sample, one line each, on the next report.
pub struct TracePrinter {
    lines: Vec<String>,
    max_lines: usize,
    dropped: u64,
}

impl TracePrinter {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Vec::new(),
            max_lines: max_lines.max(1),
            dropped: 0,
        }
    }
}

impl Analysis for TracePrinter {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn ingest(&mut self, sample: &Sample) {
        if self.lines.len() >= self.max_lines {
            self.dropped += 1;
            return;
        }
        self.lines.push(sample.to_string());
    }

    fn report(&mut self, _now_ns: u64, _geometry: &Geometry, frame: &mut Frame) {
        for line in self.lines.drain(..) {
            frame.push(line);
        }
        if self.dropped > 0 {
            frame.push(format!("... {} samples not shown", self.dropped));
            self.dropped = 0;
        }
    }

    fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            entries: self.lines.len(),
            ..Default::default()
        }
    }
}
