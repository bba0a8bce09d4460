use super::{
    CorrelationStrategy, MatchInfo, PrintContext, Remaining, RemainingReason, StrategyOptions,
    SweepPolicy,
};
use crate::aggregate::latency::format_us;
use crate::aggregate::report::Frame;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::Sample;

/// Pairing bookkeeping: which first events got their second, which
/// seconds arrived alone, and what is still open.
pub struct Pair {
    options: StrategyOptions,
    opened: u64,
    paired: u64,
    reopened: u64,
    unpaired: u64,
    unpaired_lines: Vec<String>,
    open: u64,
    open_lines: Vec<String>,
    expired: u64,
}

impl Pair {
    pub fn new(options: StrategyOptions) -> Self {
        Self {
            options,
            opened: 0,
            paired: 0,
            reopened: 0,
            unpaired: 0,
            unpaired_lines: Vec::new(),
            open: 0,
            open_lines: Vec::new(),
            expired: 0,
        }
    }
}

impl CorrelationStrategy for Pair {
    fn name(&self) -> &'static str {
        "pair"
    }

    fn one(&mut self, _first: &PendingEvent) {
        self.opened += 1;
    }

    fn replaced(&mut self, _old: &PendingEvent, _new: &Sample) {
        self.reopened += 1;
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        second: &Sample,
        _info: &MatchInfo,
        _window: Option<&mut EventWindow<'_>>,
    ) {
        if first.is_some() {
            self.paired += 1;
            return;
        }
        self.unpaired += 1;
        if !self.options.capped(self.unpaired_lines.len()) {
            self.unpaired_lines.push(format!("  unpaired {second}"));
        }
    }

    fn remaining(&mut self, pending: &PendingEvent, now_ns: u64, reason: RemainingReason) -> Remaining {
        match reason {
            RemainingReason::Open => {
                self.open += 1;
                if !self.options.capped(self.open_lines.len()) {
                    self.open_lines.push(format!(
                        "  open {}us {}",
                        format_us(pending.age(now_ns) as f64),
                        pending.sample
                    ));
                }
                Remaining::Continue
            }
            // Past the window an open event is counted once as expired and
            // dropped. It no longer shows in the open listing.
            RemainingReason::Expired | RemainingReason::Evicted => {
                self.expired += 1;
                Remaining::Break
            }
        }
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!(
            "[{}] {:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            ctx.id, "PAIR", "opened", "paired", "reopened", "unpaired", "open", "expired"
        ));
    }

    fn print(&mut self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!(
            "[{}] {:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            ctx.id,
            ctx.label(),
            self.opened,
            self.paired,
            self.reopened,
            self.unpaired,
            self.open,
            self.expired
        ));
        for line in self.unpaired_lines.drain(..).chain(self.open_lines.drain(..)) {
            frame.push(line);
        }
        self.opened = 0;
        self.paired = 0;
        self.reopened = 0;
        self.unpaired = 0;
        self.open = 0;
        self.expired = 0;
    }

    fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::object::{ObjectId, ObjectStats};
    use crate::tracer::event::EventDef;
    use crate::tracer::parse::{encode_record, Decoder, SchemaDecoder};

    fn sample(event: u16, tid: u32, t: u64) -> Sample {
        let events = vec![
            EventDef {
                name: "lock".to_string(),
                id: 1,
                fields: vec![],
                key: None,
            },
            EventDef {
                name: "unlock".to_string(),
                id: 2,
                fields: vec![],
                key: None,
            },
        ];
        let d = SchemaDecoder::new(&events, None).expect("schema");
        let mut raw = Vec::new();
        encode_record(&mut raw, t, tid, tid, 0, event, b"p", &[]);
        d.decode(&raw).expect("decode")
    }

    fn pending(key: u64, t: u64) -> PendingEvent {
        PendingEvent {
            key,
            seq: 0,
            sample: sample(1, key as u32, t),
        }
    }

    #[test]
    fn test_pair_counts_and_open_listing() {
        let mut pair = Pair::new(StrategyOptions::default());
        let info = MatchInfo {
            object: ObjectId(3),
            key: 1,
            latency_ns: None,
        };

        pair.one(&pending(1, 0));
        pair.one(&pending(2, 0));
        pair.replaced(&pending(2, 0), &sample(1, 2, 5));
        pair.two(Some(&pending(1, 0)), &sample(2, 1, 10), &info, None);
        pair.two(None, &sample(2, 9, 11), &info, None);
        assert_eq!(pair.remaining(&pending(2, 5), 2_005, RemainingReason::Open), Remaining::Continue);
        assert_eq!(pair.remaining(&pending(4, 0), 9_999, RemainingReason::Expired), Remaining::Break);

        let stats = ObjectStats::default();
        let ctx = PrintContext {
            id: ObjectId(3),
            first: "lock",
            second: "unlock",
            pending: 1,
            stats: &stats,
        };
        let mut frame = Frame::new();
        pair.print(&ctx, &mut frame);
        let texts = frame.texts();
        assert_eq!(
            texts[0],
            format!(
                "[3] {:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                "lock->unlock", 2, 1, 1, 1, 1, 1
            )
        );
        assert!(texts[1].starts_with("  unpaired "));
        assert!(texts[2].starts_with("  open 2.000us "));

        let mut again = Frame::new();
        pair.print(&ctx, &mut again);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_pair_open_listed_until_expired() {
        let mut pair = Pair::new(StrategyOptions::default());
        let stats = ObjectStats::default();
        let ctx = PrintContext {
            id: ObjectId(0),
            first: "lock",
            second: "unlock",
            pending: 1,
            stats: &stats,
        };
        let open = pending(5, 0);

        assert_eq!(pair.remaining(&open, 1_000, RemainingReason::Open), Remaining::Continue);
        let mut frame = Frame::new();
        pair.print(&ctx, &mut frame);
        assert_eq!(frame.len(), 2);
        assert!(frame.texts()[1].starts_with("  open 1.000us "));

        assert_eq!(pair.remaining(&open, 5_000, RemainingReason::Expired), Remaining::Break);
        let mut frame = Frame::new();
        pair.print(&ctx, &mut frame);
        assert_eq!(frame.len(), 1);
        assert_eq!(
            frame.texts()[0],
            format!(
                "[0] {:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                "lock->unlock", 0, 0, 0, 0, 0, 1
            )
        );
    }

    #[test]
    fn test_pair_sweeps_everything() {
        assert_eq!(Pair::new(StrategyOptions::default()).sweep_policy(), SweepPolicy::All);
    }
}
