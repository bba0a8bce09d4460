//! One declared event pair and its pending first events.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use super::strategy::{
    CorrelationStrategy, DuplicatePolicy, MatchInfo, PrintContext, Remaining, RemainingReason,
    SweepPolicy,
};
use super::window::Timeline;
use crate::aggregate::report::Frame;
use crate::tracer::event::{EventTypeId, Sample};

/// Stable identifier of a correlation object within its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A first event waiting for its second.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub key: u64,
    /// Arrival sequence number within the class.
    pub seq: u64,
    pub sample: Sample,
}

impl PendingEvent {
    pub fn time_ns(&self) -> u64 {
        self.sample.time_ns()
    }

    pub fn age(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.time_ns())
    }
}

/// Lifetime counters of one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectStats {
    /// First events accepted as pending.
    pub first: u64,
    pub matched: u64,
    /// Second events with no pending first.
    pub unmatched: u64,
    pub replaced: u64,
    /// First events dropped because one was already pending.
    pub ignored: u64,
    pub expired: u64,
    pub evicted: u64,
}

impl ObjectStats {
    pub fn merge(&mut self, other: &ObjectStats) {
        self.first += other.first;
        self.matched += other.matched;
        self.unmatched += other.unmatched;
        self.replaced += other.replaced;
        self.ignored += other.ignored;
        self.expired += other.expired;
        self.evicted += other.evicted;
    }
}

/// Per-object limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectOptions {
    /// Pending events older than this are swept.
    pub window_ns: u64,
    /// Cap on pending events. The oldest is evicted past it.
    pub max_pending: Option<usize>,
    /// Overrides the strategy's duplicate policy.
    pub duplicate: Option<DuplicatePolicy>,
}

impl Default for ObjectOptions {
    fn default() -> Self {
        Self {
            window_ns: 1_000_000_000,
            max_pending: None,
            duplicate: None,
        }
    }
}

/// Pending events of one pair, keyed by correlation key.
pub struct CorrelationObject {
    id: ObjectId,
    first_type: EventTypeId,
    second_type: EventTypeId,
    first_name: String,
    second_name: String,
    strategy: Box<dyn CorrelationStrategy>,
    pending: BTreeMap<u64, PendingEvent>,
    by_arrival: BTreeMap<u64, u64>,
    options: ObjectOptions,
    duplicate: DuplicatePolicy,
    deleting: bool,
    stats: ObjectStats,
}

impl CorrelationObject {
    pub fn new(
        id: ObjectId,
        types: (EventTypeId, EventTypeId),
        names: (String, String),
        strategy: Box<dyn CorrelationStrategy>,
        options: ObjectOptions,
    ) -> Self {
        let duplicate = options.duplicate.unwrap_or_else(|| strategy.duplicate_policy());
        Self {
            id,
            first_type: types.0,
            second_type: types.1,
            first_name: names.0,
            second_name: names.1,
            strategy,
            pending: BTreeMap::new(),
            by_arrival: BTreeMap::new(),
            options,
            duplicate,
            deleting: false,
            stats: ObjectStats::default(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn types(&self) -> (EventTypeId, EventTypeId) {
        (self.first_type, self.second_type)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn needs_window(&self) -> bool {
        self.strategy.needs_window()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, key: u64) -> Option<&PendingEvent> {
        self.pending.get(&key)
    }

    pub fn stats(&self) -> &ObjectStats {
        &self.stats
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub(crate) fn mark_deleting(&mut self) {
        self.deleting = true;
    }

    /// Arrival sequence of the oldest pending event.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.by_arrival.keys().next().copied()
    }

    /// Route one sample of either type.
    pub fn ingest(&mut self, sample: &Sample, seq: u64, timeline: Option<&Timeline>) {
        let event_type = sample.event_type();
        if event_type == self.first_type {
            self.ingest_first(sample, seq);
        } else if event_type == self.second_type {
            self.ingest_second(sample, seq, timeline);
        }
    }

    fn ingest_first(&mut self, sample: &Sample, seq: u64) {
        let key = sample.key;
        if let Some(existing) = self.pending.get(&key) {
            match self.duplicate {
                DuplicatePolicy::KeepOldest => {
                    self.stats.ignored += 1;
                    return;
                }
                DuplicatePolicy::Replace => {
                    self.strategy.replaced(existing, sample);
                    self.by_arrival.remove(&existing.seq);
                    self.stats.replaced += 1;
                }
            }
        }

        let pending = PendingEvent {
            key,
            seq,
            sample: sample.clone(),
        };
        self.strategy.one(&pending);
        self.by_arrival.insert(seq, key);
        self.pending.insert(key, pending);
        self.stats.first += 1;
        self.enforce_capacity(sample.time_ns());
    }

    fn ingest_second(&mut self, sample: &Sample, seq: u64, timeline: Option<&Timeline>) {
        let key = sample.key;
        let first = self.pending.remove(&key);
        if let Some(f) = &first {
            self.by_arrival.remove(&f.seq);
            self.stats.matched += 1;
        } else {
            self.stats.unmatched += 1;
        }

        let info = MatchInfo {
            object: self.id,
            key,
            latency_ns: first
                .as_ref()
                .map(|f| sample.time_ns().saturating_sub(f.time_ns())),
        };
        let mut window = timeline.map(|t| t.window(first.as_ref().map(|f| f.seq), seq));
        self.strategy.two(first.as_ref(), sample, &info, window.as_mut());
    }

    fn enforce_capacity(&mut self, now_ns: u64) {
        let Some(max) = self.options.max_pending else {
            return;
        };
        while self.pending.len() > max {
            let Some((_, key)) = self.by_arrival.pop_first() else {
                break;
            };
            if let Some(evicted) = self.pending.remove(&key) {
                self.strategy.remaining(&evicted, now_ns, RemainingReason::Evicted);
                self.stats.evicted += 1;
                debug!(object = self.id.0, key, "Evicted pending event over capacity");
            }
        }
    }

    /// Offer pending events to the strategy in arrival order. Returns how
    /// many were removed.
    pub fn sweep(&mut self, now_ns: u64) -> usize {
        let policy = self.strategy.sweep_policy();
        let window_ns = self.options.window_ns;
        let mut dropped = Vec::new();

        for (&seq, key) in &self.by_arrival {
            let Some(event) = self.pending.get(key) else {
                continue;
            };
            let expired = event.age(now_ns) > window_ns;
            if !expired && policy == SweepPolicy::Expired {
                continue;
            }
            let reason = if expired {
                RemainingReason::Expired
            } else {
                RemainingReason::Open
            };
            if self.strategy.remaining(event, now_ns, reason) == Remaining::Break {
                dropped.push(seq);
            }
        }

        for seq in &dropped {
            if let Some(key) = self.by_arrival.remove(seq) {
                self.pending.remove(&key);
                self.stats.expired += 1;
            }
        }
        dropped.len()
    }

    /// Print header and results through the strategy.
    pub fn report(&mut self, frame: &mut Frame) {
        let ctx = PrintContext {
            id: self.id,
            first: &self.first_name,
            second: &self.second_name,
            pending: self.pending.len(),
            stats: &self.stats,
        };
        self.strategy.print_header(&ctx, frame);
        self.strategy.print(&ctx, frame);
    }
}

impl fmt::Debug for CorrelationObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationObject")
            .field("id", &self.id)
            .field("first", &self.first_name)
            .field("second", &self.second_name)
            .field("strategy", &self.strategy.name())
            .field("pending", &self.pending.len())
            .field("deleting", &self.deleting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::tracer::event::EventDef;
    use crate::tracer::parse::{encode_record, Decoder, SchemaDecoder};

    /// Records every hook call.
    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        policy: Option<SweepPolicy>,
        keep: bool,
    }

    impl CorrelationStrategy for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn one(&mut self, first: &PendingEvent) {
            self.log.lock().push(format!("one {} @{}", first.key, first.time_ns()));
        }

        fn replaced(&mut self, old: &PendingEvent, new: &Sample) {
            self.log
                .lock()
                .push(format!("replaced {} @{} by @{}", old.key, old.time_ns(), new.time_ns()));
        }

        fn two(
            &mut self,
            first: Option<&PendingEvent>,
            second: &Sample,
            info: &MatchInfo,
            _window: Option<&mut crate::correlate::window::EventWindow<'_>>,
        ) {
            self.log.lock().push(format!(
                "two {} first={} latency={:?}",
                second.key,
                first.is_some(),
                info.latency_ns
            ));
        }

        fn remaining(&mut self, pending: &PendingEvent, _now: u64, reason: RemainingReason) -> Remaining {
            self.log.lock().push(format!("remaining {} {:?}", pending.key, reason));
            if self.keep {
                Remaining::Continue
            } else {
                Remaining::Break
            }
        }

        fn sweep_policy(&self) -> SweepPolicy {
            self.policy.unwrap_or(SweepPolicy::Expired)
        }
    }

    fn decoder() -> SchemaDecoder {
        let events = vec![
            EventDef {
                name: "enter".to_string(),
                id: 1,
                fields: vec![],
                key: None,
            },
            EventDef {
                name: "exit".to_string(),
                id: 2,
                fields: vec![],
                key: None,
            },
        ];
        SchemaDecoder::new(&events, None).expect("schema")
    }

    fn sample(decoder: &SchemaDecoder, event: u16, tid: u32, time_ns: u64) -> Sample {
        let mut raw = Vec::new();
        encode_record(&mut raw, time_ns, tid, tid, 0, event, b"t", &[]);
        decoder.decode(&raw).expect("decode")
    }

    fn object(recorder: Recorder, options: ObjectOptions) -> CorrelationObject {
        CorrelationObject::new(
            ObjectId(0),
            (EventTypeId(1), EventTypeId(2)),
            ("enter".to_string(), "exit".to_string()),
            Box::new(recorder),
            options,
        )
    }

    #[test]
    fn test_match_pairs_by_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obj = object(
            Recorder {
                log: log.clone(),
                ..Default::default()
            },
            ObjectOptions::default(),
        );
        let d = decoder();

        obj.ingest(&sample(&d, 1, 7, 100), 0, None);
        obj.ingest(&sample(&d, 2, 8, 150), 1, None);
        obj.ingest(&sample(&d, 2, 7, 400), 2, None);

        assert_eq!(
            *log.lock(),
            vec![
                "one 7 @100".to_string(),
                "two 8 first=false latency=None".to_string(),
                "two 7 first=true latency=Some(300)".to_string(),
            ]
        );
        assert_eq!(obj.pending_len(), 0);
        assert_eq!(obj.stats().matched, 1);
        assert_eq!(obj.stats().unmatched, 1);
    }

    #[test]
    fn test_duplicate_replaces_by_default() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obj = object(
            Recorder {
                log: log.clone(),
                ..Default::default()
            },
            ObjectOptions::default(),
        );
        let d = decoder();
        obj.ingest(&sample(&d, 1, 7, 100), 0, None);
        obj.ingest(&sample(&d, 1, 7, 120), 1, None);

        assert_eq!(obj.pending_len(), 1);
        assert_eq!(obj.pending(7).map(PendingEvent::time_ns), Some(120));
        assert_eq!(obj.oldest_seq(), Some(1));
        assert_eq!(log.lock()[1], "replaced 7 @100 by @120");
        assert_eq!(obj.stats().replaced, 1);
    }

    #[test]
    fn test_duplicate_keep_oldest() {
        let mut obj = object(
            Recorder::default(),
            ObjectOptions {
                duplicate: Some(DuplicatePolicy::KeepOldest),
                ..Default::default()
            },
        );
        let d = decoder();
        obj.ingest(&sample(&d, 1, 7, 100), 0, None);
        obj.ingest(&sample(&d, 1, 7, 120), 1, None);
        assert_eq!(obj.pending(7).map(PendingEvent::time_ns), Some(100));
        assert_eq!(obj.stats().ignored, 1);
    }

    #[test]
    fn test_sweep_expires_only_old_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obj = object(
            Recorder {
                log: log.clone(),
                ..Default::default()
            },
            ObjectOptions {
                window_ns: 1_000,
                ..Default::default()
            },
        );
        let d = decoder();
        obj.ingest(&sample(&d, 1, 1, 0), 0, None);
        obj.ingest(&sample(&d, 1, 2, 900), 1, None);

        assert_eq!(obj.sweep(1_500), 1);
        assert_eq!(obj.pending_len(), 1);
        assert!(obj.pending(2).is_some());
        assert_eq!(log.lock().last().map(String::as_str), Some("remaining 1 Expired"));
        assert_eq!(obj.stats().expired, 1);

        // A second event for the expired key no longer matches.
        obj.ingest(&sample(&d, 2, 1, 1_600), 2, None);
        assert_eq!(obj.stats().unmatched, 1);
    }

    #[test]
    fn test_sweep_all_offers_open_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obj = object(
            Recorder {
                log: log.clone(),
                policy: Some(SweepPolicy::All),
                keep: true,
            },
            ObjectOptions::default(),
        );
        let d = decoder();
        obj.ingest(&sample(&d, 1, 3, 0), 0, None);
        assert_eq!(obj.sweep(10), 0);
        assert_eq!(obj.pending_len(), 1);
        assert_eq!(log.lock().last().map(String::as_str), Some("remaining 3 Open"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obj = object(
            Recorder {
                log: log.clone(),
                ..Default::default()
            },
            ObjectOptions {
                max_pending: Some(2),
                ..Default::default()
            },
        );
        let d = decoder();
        for (seq, tid) in [5u32, 6, 7].iter().enumerate() {
            obj.ingest(&sample(&d, 1, *tid, seq as u64), seq as u64, None);
        }
        assert_eq!(obj.pending_len(), 2);
        assert!(obj.pending(5).is_none());
        assert_eq!(obj.stats().evicted, 1);
        assert!(log.lock().contains(&"remaining 5 Evicted".to_string()));
    }
}
