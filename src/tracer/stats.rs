use std::collections::HashMap;

use super::event::EventTypeId;

/// Per-event-type sample counters.
///
/// `snapshot()` reads and resets all counters, for once-per-cycle
/// reporting. Slots for seen event types are kept so steady-state
/// recording does not allocate.
#[derive(Debug, Default)]
pub struct EventStats {
    counts: HashMap<EventTypeId, u64>,
}

impl EventStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for the given event type by one.
    pub fn record(&mut self, t: EventTypeId) {
        self.record_n(t, 1);
    }

    /// Increment the counter for the given event type by n.
    pub fn record_n(&mut self, t: EventTypeId, n: u64) {
        *self.counts.entry(t).or_insert(0) += n;
    }

    /// Read and reset all counters, returning only non-zero entries
    /// ordered by event type.
    pub fn snapshot(&mut self) -> Vec<(EventTypeId, u64)> {
        let mut result: Vec<(EventTypeId, u64)> = self
            .counts
            .iter_mut()
            .filter(|(_, v)| **v > 0)
            .map(|(t, v)| (*t, std::mem::take(v)))
            .collect();
        result.sort_unstable_by_key(|(t, _)| *t);
        result
    }
}

/// Running totals for the ingestion path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Raw records handed to the session.
    pub received: u64,
    /// Records that decoded into a sample.
    pub decoded: u64,
    /// Records dropped because they failed to decode.
    pub decode_errors: u64,
    /// Records dropped because the session was already shut down.
    pub dropped: u64,
    /// Completed report cycles.
    pub cycles: u64,
}
