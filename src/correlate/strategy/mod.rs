//! Pluggable per-pair behaviour of a correlation object.

mod call;
mod call_delay;
mod delay;
mod mem_profile;
mod pair;
mod syscalls;

pub use call::Call;
pub use call_delay::CallDelay;
pub use delay::Delay;
pub use mem_profile::MemProfile;
pub use pair::Pair;
pub use syscalls::{syscall_name, Syscalls};

use serde::Deserialize;

use super::object::{ObjectId, ObjectStats, PendingEvent};
use super::window::EventWindow;
use super::CorrelationError;
use crate::aggregate::report::Frame;
use crate::tracer::event::Sample;

/// Strategy names accepted by [`build`].
pub const STRATEGY_NAMES: [&str; 6] = ["delay", "pair", "mem-profile", "call", "call-delay", "syscalls"];

/// Whether a pending event survives a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Continue,
    Break,
}

/// Why a pending event is handed to `remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingReason {
    /// Older than the object's window.
    Expired,
    /// Still within the window; offered to strategies that sweep everything.
    Open,
    /// Pushed out by the pending capacity limit. The return value is ignored.
    Evicted,
}

/// Which pending events a sweep offers to the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPolicy {
    /// Only events older than the window.
    Expired,
    /// Every pending event.
    All,
}

/// What happens when a first event arrives for a key that is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// The newer event replaces the pending one.
    #[default]
    Replace,
    /// The pending event is kept and the newer one ignored.
    KeepOldest,
}

/// Match metadata handed to `two`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchInfo {
    pub object: ObjectId,
    pub key: u64,
    /// Time from first to second event. `None` when unmatched.
    pub latency_ns: Option<u64>,
}

/// Read-only object state available while printing.
#[derive(Debug, Clone, Copy)]
pub struct PrintContext<'a> {
    pub id: ObjectId,
    pub first: &'a str,
    pub second: &'a str,
    pub pending: usize,
    pub stats: &'a ObjectStats,
}

impl PrintContext<'_> {
    /// "first->second", used as the row label of most strategies.
    pub fn label(&self) -> String {
        format!("{}->{}", self.first, self.second)
    }
}

/// Per-pair callbacks. Every hook has a default so strategies implement
/// only what they use.
pub trait CorrelationStrategy: Send {
    fn name(&self) -> &'static str;

    /// A first event became pending.
    fn one(&mut self, _first: &PendingEvent) {}

    /// A pending first event is being replaced by a newer one for the same key.
    fn replaced(&mut self, _old: &PendingEvent, _new: &Sample) {}

    /// A second event arrived, with its first event when one was pending.
    fn two(
        &mut self,
        _first: Option<&PendingEvent>,
        _second: &Sample,
        _info: &MatchInfo,
        _window: Option<&mut EventWindow<'_>>,
    ) {
    }

    /// A pending event offered by a sweep.
    fn remaining(&mut self, _pending: &PendingEvent, _now_ns: u64, _reason: RemainingReason) -> Remaining {
        Remaining::Break
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!("[{}] {} ({})", ctx.id, ctx.label(), self.name()));
    }

    /// Render this cycle's results and reset per-cycle state.
    fn print(&mut self, _ctx: &PrintContext<'_>, _frame: &mut Frame) {}

    /// Whether `two` needs the surrounding samples.
    fn needs_window(&self) -> bool {
        false
    }

    fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy::Expired
    }

    fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::Replace
    }
}

/// Knobs shared by the built-in strategies. Field indices refer to the
/// payload of the event named in each comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOptions {
    /// Print matched pairs slower than this, with their window.
    pub greater_than_ns: Option<u64>,
    /// Cap on detail lines per cycle. Zero means unlimited.
    pub first_n: usize,
    /// Break delay statistics down per key.
    pub per_key: bool,
    /// Allocation size field of the first event.
    pub bytes_field: Option<usize>,
    /// Syscall number field of the first event.
    pub id_field: Option<usize>,
    /// Return value field of the second event.
    pub ret_field: Option<usize>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            greater_than_ns: None,
            first_n: 10,
            per_key: false,
            bytes_field: None,
            id_field: None,
            ret_field: None,
        }
    }
}

impl StrategyOptions {
    /// Whether `n` detail lines were already printed.
    pub(crate) fn capped(&self, n: usize) -> bool {
        self.first_n != 0 && n >= self.first_n
    }
}

/// Instantiate a strategy by name.
pub fn build(name: &str, options: &StrategyOptions) -> Result<Box<dyn CorrelationStrategy>, CorrelationError> {
    let strategy: Box<dyn CorrelationStrategy> = match name {
        "delay" => Box::new(Delay::new(options.clone())),
        "pair" => Box::new(Pair::new(options.clone())),
        "mem-profile" | "kmemprof" => Box::new(MemProfile::new(options.clone())),
        "call" => Box::new(Call::new()),
        "call-delay" => Box::new(CallDelay::new(options.clone())),
        "syscalls" => Box::new(Syscalls::new(options.clone())),
        other => {
            return Err(CorrelationError::UnknownStrategy {
                name: other.to_string(),
            })
        }
    };
    Ok(strategy)
}

/// Strategies that walk the samples between a pair.
pub fn based_on_call(name: &str) -> bool {
    matches!(name, "call" | "call-delay")
}
