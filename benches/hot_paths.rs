use criterion::{black_box, criterion_group, criterion_main, Criterion};
use proftop::aggregate::accumulator::CounterVector;
use proftop::aggregate::rank::RankOrder;
use proftop::aggregate::table::KeyedTable;
use proftop::correlate::object::ObjectOptions;
use proftop::correlate::strategy::{build, StrategyOptions};
use proftop::correlate::CorrelationClass;
use proftop::tracer::event::{EventDef, EventTypeId, Sample};
use proftop::tracer::parse::{encode_record, Decoder, SchemaDecoder};

fn decoder() -> SchemaDecoder {
    let events = vec![
        EventDef {
            name: "sys_enter".to_string(),
            id: 1,
            fields: vec!["id".to_string()],
            key: None,
        },
        EventDef {
            name: "sys_exit".to_string(),
            id: 2,
            fields: vec!["id".to_string(), "ret".to_string()],
            key: None,
        },
    ];
    SchemaDecoder::new(&events, None).expect("schema")
}

fn record(time_ns: u64, tid: u32, event_type: u16, values: &[u64]) -> Vec<u8> {
    let mut raw = Vec::new();
    encode_record(&mut raw, time_ns, tid, tid, 0, event_type, b"geth", values);
    raw
}

fn bench_decode(c: &mut Criterion) {
    let d = decoder();
    let enter = record(123_456_789, 1337, 1, &[202]);
    let exit = record(123_459_000, 1337, 2, &[202, 0]);

    c.bench_function("decode/sys_enter", |b| {
        b.iter(|| d.decode(black_box(&enter)).expect("decode enter"))
    });

    c.bench_function("decode/sys_exit", |b| {
        b.iter(|| d.decode(black_box(&exit)).expect("decode exit"))
    });
}

fn bench_upsert(c: &mut Criterion) {
    let mut table: KeyedTable<u64, CounterVector> = KeyedTable::new(|| CounterVector::new(3));
    for key in 0..1_024u64 {
        table.upsert(key, |r| r.add(0, 1));
    }
    let mut i = 0u64;

    c.bench_function("table/upsert_existing_key", |b| {
        b.iter(|| {
            i = i.wrapping_add(7);
            table.upsert(black_box(i % 1_024), |r| {
                r.add(0, 1);
                r.add(2, i);
            });
        })
    });
}

fn bench_drain(c: &mut Criterion) {
    let order = RankOrder::new(3, &[0]);

    c.bench_function("table/drain_sorted_1k", |b| {
        b.iter(|| {
            let mut table: KeyedTable<u64, CounterVector> =
                KeyedTable::new(|| CounterVector::new(3));
            for key in 0..1_024u64 {
                table.upsert(key, |r| r.add(0, key % 17));
            }
            let rows = table.drain_sorted(|ka, a, kb, b| {
                order.compare_keyed(ka, a.values(), kb, b.values())
            });
            black_box(rows.len())
        })
    });
}

fn bench_correlate(c: &mut Criterion) {
    let d = decoder();
    let mut class = CorrelationClass::new();
    let strategy = build("syscalls", &StrategyOptions {
        id_field: Some(0),
        ret_field: Some(1),
        ..Default::default()
    })
    .expect("strategy");
    class
        .declare_pair(EventTypeId(1), EventTypeId(2), strategy, ObjectOptions::default())
        .expect("declare");

    let pairs: Vec<(Sample, Sample)> = (0..256u64)
        .map(|i| {
            let tid = 2_000 + i as u32;
            (
                d.decode(&record(i * 100, tid, 1, &[i % 64])).expect("enter"),
                d.decode(&record(i * 100 + 40, tid, 2, &[i % 64, 0])).expect("exit"),
            )
        })
        .collect();

    c.bench_function("correlate/dispatch_syscall_pair", |b| {
        let mut n = 0usize;
        b.iter(|| {
            let (enter, exit) = &pairs[n % pairs.len()];
            n += 1;
            black_box(class.dispatch(enter));
            black_box(class.dispatch(exit));
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_upsert(c);
    bench_drain(c);
    bench_correlate(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
