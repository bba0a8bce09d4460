//! Recent-sample timeline and the cursor strategies use to walk it.

use std::collections::VecDeque;

use crate::tracer::event::Sample;

/// Default number of samples kept for event windows.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 65_536;

/// Bounded ring of recently dispatched samples in arrival order.
#[derive(Debug)]
pub struct Timeline {
    entries: VecDeque<(u64, Sample)>,
    capacity: usize,
}

impl Timeline {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Record a sample under its arrival sequence number.
    pub fn push(&mut self, seq: u64, sample: &Sample) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, sample.clone()));
    }

    /// Drop every sample older than `seq`.
    pub fn trim_before(&mut self, seq: u64) {
        while self.entries.front().is_some_and(|(s, _)| *s < seq) {
            self.entries.pop_front();
        }
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|(s, _)| *s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index_of(&self, seq: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&seq, |(s, _)| *s).ok()
    }

    /// Cursor over the samples around a matched pair. `first` is absent
    /// when the second event had no match or the first fell out of the
    /// timeline.
    pub fn window(&self, first: Option<u64>, second: u64) -> EventWindow<'_> {
        let event1 = first.and_then(|s| self.index_of(s));
        let event2 = self.index_of(second);
        EventWindow::new(&self.entries, event1, event2)
    }
}

/// Cursor over the neighbourhood of one matched pair.
///
/// The window spans from one sample before event1 up to event2. `reset`
/// parks the cursor on the boundary just before event1, so `next` then
/// yields event1 and `prev` yields the sample before it. Only valid for
/// the duration of the callback it was handed to.
#[derive(Debug)]
pub struct EventWindow<'a> {
    entries: &'a VecDeque<(u64, Sample)>,
    event1: Option<usize>,
    event2: Option<usize>,
    lo: usize,
    start: usize,
    pos: Option<usize>,
}

#[allow(clippy::should_implement_trait)]
impl<'a> EventWindow<'a> {
    fn new(
        entries: &'a VecDeque<(u64, Sample)>,
        event1: Option<usize>,
        event2: Option<usize>,
    ) -> Self {
        let start = event1.or(event2).unwrap_or(0);
        let lo = match event1 {
            Some(i) => i.saturating_sub(1),
            None => start,
        };
        Self {
            entries,
            event1,
            event2,
            lo,
            start,
            pos: None,
        }
    }

    fn at(&self, idx: usize) -> Option<&'a Sample> {
        let entries: &'a VecDeque<(u64, Sample)> = self.entries;
        entries.get(idx).map(|(_, s)| s)
    }

    /// Park on the boundary just before event1.
    pub fn reset(&mut self) {
        self.pos = None;
    }

    pub fn to_event1(&mut self) -> Option<&'a Sample> {
        let idx = self.event1?;
        self.pos = Some(idx);
        self.at(idx)
    }

    pub fn to_event2(&mut self) -> Option<&'a Sample> {
        let idx = self.event2?;
        self.pos = Some(idx);
        self.at(idx)
    }

    /// Step forward. Stops at event2.
    pub fn next(&mut self) -> Option<&'a Sample> {
        let hi = self.event2?;
        let idx = match self.pos {
            None => self.start,
            Some(p) => p + 1,
        };
        if idx > hi {
            return None;
        }
        self.pos = Some(idx);
        self.at(idx)
    }

    /// Step backward. Stops one sample before event1.
    pub fn prev(&mut self) -> Option<&'a Sample> {
        self.event2?;
        let idx = match self.pos {
            None => self.start.checked_sub(1)?,
            Some(p) => p.checked_sub(1)?,
        };
        if idx < self.lo {
            return None;
        }
        self.pos = Some(idx);
        self.at(idx)
    }

    /// Samples strictly between event1 and event2.
    pub fn between(&self) -> impl Iterator<Item = &'a Sample> + 'a {
        let range = match (self.event1, self.event2) {
            (Some(a), Some(b)) if a < b => a + 1..b,
            _ => 0..0,
        };
        let entries: &'a VecDeque<(u64, Sample)> = self.entries;
        entries.range(range).map(|(_, s)| s)
    }

    /// Whether event1 is still available.
    pub fn has_event1(&self) -> bool {
        self.event1.is_some()
    }
}
