use std::sync::Arc;

use parking_lot::Mutex;
use proftop::aggregate::accumulator::{CounterVector, DiffCounter, Histogram};
use proftop::aggregate::rank::RankOrder;
use proftop::aggregate::report::{CaptureSink, Geometry};
use proftop::aggregate::table::KeyedTable;
use proftop::config::{Config, Mode, PairConfig};
use proftop::correlate::object::{ObjectOptions, PendingEvent};
use proftop::correlate::strategy::{
    CorrelationStrategy, DuplicatePolicy, MatchInfo, Remaining, RemainingReason,
};
use proftop::correlate::window::EventWindow;
use proftop::correlate::CorrelationClass;
use proftop::session::Session;
use proftop::tracer::event::{EventDef, Sample};
use proftop::tracer::parse::{encode_record, Decoder, SchemaDecoder};

fn event(name: &str, id: u16, fields: &[&str], key: Option<&str>) -> EventDef {
    EventDef {
        name: name.to_string(),
        id,
        fields: fields.iter().map(|f| f.to_string()).collect(),
        key: key.map(str::to_string),
    }
}

fn record(time_ns: u64, pid: u32, event_type: u16, values: &[u64]) -> Vec<u8> {
    let mut raw = Vec::new();
    encode_record(&mut raw, time_ns, pid, pid + 1000, 1, event_type, b"bench", values);
    raw
}

/// Logs every callback it receives.
#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl CorrelationStrategy for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        _second: &Sample,
        info: &MatchInfo,
        _window: Option<&mut EventWindow<'_>>,
    ) {
        let entry = match (first, info.latency_ns) {
            (Some(_), Some(latency)) => format!("matched key={} latency={latency}", info.key),
            _ => format!("second-without-first key={}", info.key),
        };
        self.log.lock().push(entry);
    }

    fn remaining(&mut self, pending: &PendingEvent, _now_ns: u64, reason: RemainingReason) -> Remaining {
        self.log
            .lock()
            .push(format!("remaining key={} {reason:?}", pending.key));
        Remaining::Break
    }
}

#[test]
fn test_counter_round_trip_through_table() {
    let events = vec![event("tick", 1, &[], None)];
    let decoder = SchemaDecoder::new(&events, Some("common_pid")).expect("schema");

    let mut table: KeyedTable<u64, CounterVector> = KeyedTable::new(|| CounterVector::new(1));
    for pid in [5, 7, 5] {
        let sample = decoder.decode(&record(0, pid, 1, &[])).expect("decode");
        table.upsert(sample.key, |r| r.add(0, 1));
    }

    let order = RankOrder::from_names(&["count"], &["count"]).expect("rank");
    let drained: Vec<(u64, u64)> = table
        .drain_sorted(|ka, a, kb, b| order.compare_keyed(ka, a.values(), kb, b.values()))
        .into_iter()
        .map(|(k, r)| (k, r.get(0)))
        .collect();

    assert_eq!(drained, vec![(5, 2), (7, 1)]);
    assert!(table.is_empty());
}

#[test]
fn test_counter_round_trip_through_session() {
    let mut cfg = Config {
        key_field: Some("common_pid".to_string()),
        events: vec![event("tick", 1, &[], None)],
        ..Default::default()
    };
    cfg.aggregate.rank_fields = vec!["count".to_string()];
    cfg.validate().expect("config");

    let sink = CaptureSink::new();
    let mut session =
        Session::from_config(&cfg, Box::new(sink.clone()), Geometry::default()).expect("session");
    for pid in [5, 7, 5] {
        session.process(&record(0, pid, 1, &[]));
    }
    session.shutdown();

    let rows: Vec<Vec<String>> = sink
        .lines()
        .iter()
        .skip(2)
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .collect();
    assert_eq!(rows, vec![vec!["5", "2"], vec!["7", "1"]]);
}

#[test]
fn test_diff_counter_deltas_sum_to_range() {
    let values = [100u64, 100, 130, 170, 171, 400];
    let mut counter = DiffCounter::new();
    let mut reported = 0;
    for (i, v) in values.iter().enumerate() {
        counter.update(*v);
        if i % 2 == 1 {
            reported += counter.take_delta();
        }
    }
    reported += counter.take_delta();
    assert_eq!(reported, 400 - 100);

    // A wraparound contributes nothing.
    counter.update(50);
    assert_eq!(counter.take_delta(), 0);
    counter.update(60);
    assert_eq!(counter.take_delta(), 10);
}

#[test]
fn test_histogram_clamps_to_last_bucket() {
    let mut h = Histogram::new(4);
    for offset in [0, 1, 3, 4, 9, 100] {
        h.insert(offset, 1);
    }
    assert_eq!(h.buckets(), &[1, 1, 0, 4]);
    assert_eq!(h.total(), 6);
}

#[test]
fn test_rank_ties_break_on_key() {
    let order = RankOrder::new(2, &[0]);
    for _ in 0..3 {
        let mut table: KeyedTable<u64, CounterVector> = KeyedTable::new(|| CounterVector::new(2));
        for (key, a, b) in [(30u64, 4u64, 5u64), (10, 4, 5), (20, 4, 5), (40, 9, 0)] {
            table.upsert(key, |r| {
                r.add(0, a);
                r.add(1, b);
            });
        }
        let keys: Vec<u64> = table
            .drain_sorted(|ka, a, kb, b| order.compare_keyed(ka, a.values(), kb, b.values()))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![40, 10, 20, 30]);
    }
}

fn fd_class(recorder: &Recorder) -> (SchemaDecoder, CorrelationClass) {
    fd_class_with(recorder, ObjectOptions::default())
}

fn fd_class_with(recorder: &Recorder, options: ObjectOptions) -> (SchemaDecoder, CorrelationClass) {
    let events = vec![
        event("open", 1, &["fd"], Some("fd")),
        event("close", 2, &["fd"], Some("fd")),
    ];
    let decoder = SchemaDecoder::new(&events, None).expect("schema");
    let (first, second) = decoder.check_pair_keys("open", "close").expect("keys");

    let mut class = CorrelationClass::new();
    class
        .declare_pair(first, second, Box::new(recorder.clone()), options)
        .expect("declare");
    (decoder, class)
}

#[test]
fn test_open_close_correlation() {
    let recorder = Recorder::default();
    let (decoder, mut class) = fd_class(&recorder);

    for raw in [record(0, 1, 1, &[3]), record(10, 1, 2, &[3]), record(11, 1, 2, &[9])] {
        let sample = decoder.decode(&raw).expect("decode");
        assert!(class.dispatch(&sample));
    }

    assert_eq!(
        recorder.entries(),
        vec!["matched key=3 latency=10", "second-without-first key=9"]
    );
    assert_eq!(class.pending(), 0);
}

#[test]
fn test_every_pair_matches_once() {
    let recorder = Recorder::default();
    let (decoder, mut class) = fd_class(&recorder);

    // Interleave: all opens of a round, then their closes in reverse.
    let mut t = 0;
    for round in 0..4u64 {
        let fds: Vec<u64> = (0..8).map(|i| round * 8 + i).collect();
        for fd in &fds {
            t += 1;
            class.dispatch(&decoder.decode(&record(t, 1, 1, &[*fd])).expect("open"));
        }
        for fd in fds.iter().rev() {
            t += 1;
            class.dispatch(&decoder.decode(&record(t, 1, 2, &[*fd])).expect("close"));
        }
    }

    let entries = recorder.entries();
    assert_eq!(entries.len(), 32);
    assert!(entries.iter().all(|e| e.starts_with("matched")));
    assert_eq!(class.pending(), 0);
    assert_eq!(class.totals().matched, 32);
}

#[test]
fn test_reused_key_matches_every_pair() {
    let recorder = Recorder::default();
    let (decoder, mut class) = fd_class(&recorder);

    for i in 0..16u64 {
        class.dispatch(&decoder.decode(&record(i * 10, 1, 1, &[3])).expect("open"));
        class.dispatch(&decoder.decode(&record(i * 10 + 4, 1, 2, &[3])).expect("close"));
    }
    class.sweep_all(10_000_000_000);

    let entries = recorder.entries();
    assert_eq!(entries.len(), 16);
    assert!(entries.iter().all(|e| e == "matched key=3 latency=4"));
    assert_eq!(class.pending(), 0);
    let totals = class.totals();
    assert_eq!(totals.matched, 16);
    assert_eq!(totals.expired, 0);
}

#[test]
fn test_reused_key_with_back_to_back_opens() {
    for (policy, latency) in [(DuplicatePolicy::Replace, 5), (DuplicatePolicy::KeepOldest, 10)] {
        let recorder = Recorder::default();
        let (decoder, mut class) = fd_class_with(
            &recorder,
            ObjectOptions {
                duplicate: Some(policy),
                ..Default::default()
            },
        );

        for i in 0..4u64 {
            let base = i * 100;
            class.dispatch(&decoder.decode(&record(base, 1, 1, &[3])).expect("open"));
            class.dispatch(&decoder.decode(&record(base + 5, 1, 1, &[3])).expect("reopen"));
            class.dispatch(&decoder.decode(&record(base + 10, 1, 2, &[3])).expect("close"));
        }
        class.sweep_all(10_000_000_000);

        let expected = format!("matched key=3 latency={latency}");
        assert_eq!(recorder.entries(), vec![expected; 4], "{policy:?}");
        assert_eq!(class.pending(), 0);
        let totals = class.totals();
        assert_eq!(totals.matched, 4);
        assert_eq!(totals.expired, 0);
        match policy {
            DuplicatePolicy::Replace => assert_eq!(totals.replaced, 4),
            DuplicatePolicy::KeepOldest => assert_eq!(totals.ignored, 4),
        }
    }
}

#[test]
fn test_unmatched_first_expires_once() {
    let recorder = Recorder::default();
    let (decoder, mut class) = fd_class(&recorder);

    class.dispatch(&decoder.decode(&record(0, 1, 1, &[4])).expect("open"));
    class.sweep_all(500_000_000);
    assert_eq!(class.pending(), 1);

    class.sweep_all(2_000_000_000);
    class.sweep_all(3_000_000_000);
    assert_eq!(recorder.entries(), vec!["remaining key=4 Expired"]);
    assert_eq!(class.pending(), 0);
}

#[test]
fn test_capacity_evicts_oldest() {
    let recorder = Recorder::default();
    let events = vec![
        event("open", 1, &["fd"], Some("fd")),
        event("close", 2, &["fd"], Some("fd")),
    ];
    let decoder = SchemaDecoder::new(&events, None).expect("schema");
    let (first, second) = decoder.check_pair_keys("open", "close").expect("keys");
    let mut class = CorrelationClass::new();
    class
        .declare_pair(
            first,
            second,
            Box::new(recorder.clone()),
            ObjectOptions {
                max_pending: Some(2),
                ..Default::default()
            },
        )
        .expect("declare");

    for (t, fd) in [(1, 10), (2, 11), (3, 12)] {
        class.dispatch(&decoder.decode(&record(t, 1, 1, &[fd])).expect("open"));
    }

    assert_eq!(recorder.entries(), vec!["remaining key=10 Evicted"]);
    assert_eq!(class.pending(), 2);
    assert_eq!(class.totals().evicted, 1);
}

#[test]
fn test_pair_declared_twice_with_other_strategy_fails() {
    let mut cfg = Config {
        mode: Mode::Correlate,
        events: vec![
            event("open", 1, &["fd"], Some("fd")),
            event("close", 2, &["fd"], Some("fd")),
        ],
        ..Default::default()
    };
    let pair = |strategy: &str| PairConfig {
        first: "open".to_string(),
        second: "close".to_string(),
        strategy: Some(strategy.to_string()),
    };
    cfg.correlate.pairs = vec![pair("delay"), pair("pair")];

    let err = Session::from_config(&cfg, Box::new(CaptureSink::new()), Geometry::default())
        .err()
        .expect("duplicate pair");
    assert!(format!("{err:#}").contains("open -> close"));
}

#[test]
fn test_mismatched_keys_fail_setup() {
    let mut cfg = Config {
        mode: Mode::Correlate,
        events: vec![
            event("open", 1, &["fd"], Some("fd")),
            event("close", 2, &["fd"], None),
        ],
        ..Default::default()
    };
    cfg.correlate.pairs = vec![PairConfig {
        first: "open".to_string(),
        second: "close".to_string(),
        strategy: None,
    }];

    assert!(Session::from_config(&cfg, Box::new(CaptureSink::new()), Geometry::default()).is_err());
}
