use super::{
    Call, CorrelationStrategy, Delay, MatchInfo, PrintContext, Remaining, RemainingReason,
    StrategyOptions,
};
use crate::aggregate::report::Frame;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::Sample;

/// `call` and `delay` on the same pair.
pub struct CallDelay {
    call: Call,
    delay: Delay,
}

impl CallDelay {
    pub fn new(options: StrategyOptions) -> Self {
        Self {
            call: Call::new(),
            delay: Delay::new(options),
        }
    }
}

impl CorrelationStrategy for CallDelay {
    fn name(&self) -> &'static str {
        "call-delay"
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        second: &Sample,
        info: &MatchInfo,
        mut window: Option<&mut EventWindow<'_>>,
    ) {
        self.delay.two(first, second, info, window.as_deref_mut());
        self.call.two(first, second, info, window);
    }

    fn remaining(&mut self, pending: &PendingEvent, now_ns: u64, reason: RemainingReason) -> Remaining {
        self.delay.remaining(pending, now_ns, reason)
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        self.delay.print_header(ctx, frame);
    }

    fn print(&mut self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        self.delay.print(ctx, frame);
        self.call.print_header(ctx, frame);
        self.call.print(ctx, frame);
    }

    fn needs_window(&self) -> bool {
        true
    }
}
