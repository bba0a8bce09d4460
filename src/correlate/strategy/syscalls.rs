use std::borrow::Cow;

use super::{CorrelationStrategy, MatchInfo, PrintContext, StrategyOptions};
use crate::aggregate::accumulator::{Accumulator, CarryPolicy};
use crate::aggregate::latency::{format_us, LatencyStats};
use crate::aggregate::rank::RankOrder;
use crate::aggregate::report::{Frame, ReportCycle};
use crate::aggregate::table::KeyedTable;
use crate::correlate::object::PendingEvent;
use crate::correlate::window::EventWindow;
use crate::tracer::event::Sample;

/// x86_64 syscall numbers 0..=62.
const SYSCALLS_X86_64: [&str; 63] = [
    "read", "write", "open", "close", "stat", "fstat", "lstat", "poll", "lseek", "mmap",
    "mprotect", "munmap", "brk", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "ioctl",
    "pread64", "pwrite64", "readv", "writev", "access", "pipe", "select", "sched_yield",
    "mremap", "msync", "mincore", "madvise", "shmget", "shmat", "shmctl", "dup", "dup2",
    "pause", "nanosleep", "getitimer", "alarm", "setitimer", "getpid", "sendfile", "socket",
    "connect", "accept", "sendto", "recvfrom", "sendmsg", "recvmsg", "shutdown", "bind",
    "listen", "getsockname", "getpeername", "socketpair", "setsockopt", "getsockopt", "clone",
    "fork", "vfork", "execve", "exit", "wait4", "kill",
];

/// Name of an x86_64 syscall number, or `syscall_<n>` when unknown.
pub fn syscall_name(id: u64) -> Cow<'static, str> {
    if let Some(name) = usize::try_from(id).ok().and_then(|i| SYSCALLS_X86_64.get(i).copied()) {
        return Cow::Borrowed(name);
    }
    let name = match id {
        72 => "fcntl",
        74 => "fsync",
        75 => "fdatasync",
        202 => "futex",
        228 => "clock_gettime",
        230 => "clock_nanosleep",
        231 => "exit_group",
        232 => "epoll_wait",
        257 => "openat",
        281 => "epoll_pwait",
        288 => "accept4",
        291 => "epoll_create1",
        318 => "getrandom",
        425 => "io_uring_setup",
        426 => "io_uring_enter",
        _ => return Cow::Owned(format!("syscall_{id}")),
    };
    Cow::Borrowed(name)
}

#[derive(Debug, Clone, Default)]
struct SyscallRow {
    latency: LatencyStats,
    errors: u64,
}

impl Accumulator for SyscallRow {
    const CARRY: CarryPolicy = CarryPolicy::Reset;
}

/// Per-syscall latency and error counts from enter/exit pairs.
pub struct Syscalls {
    options: StrategyOptions,
    table: KeyedTable<u64, SyscallRow>,
    order: RankOrder,
    cycle: ReportCycle,
}

impl Syscalls {
    pub fn new(options: StrategyOptions) -> Self {
        Self {
            options,
            table: KeyedTable::new(SyscallRow::default),
            // calls, total(ns), errors; ranked by total
            order: RankOrder::new(3, &[1]),
            cycle: ReportCycle::new(),
        }
    }
}

impl CorrelationStrategy for Syscalls {
    fn name(&self) -> &'static str {
        "syscalls"
    }

    fn two(
        &mut self,
        first: Option<&PendingEvent>,
        second: &Sample,
        info: &MatchInfo,
        _window: Option<&mut EventWindow<'_>>,
    ) {
        let (Some(first), Some(latency_ns)) = (first, info.latency_ns) else {
            return;
        };
        let id = self
            .options
            .id_field
            .and_then(|i| first.sample.fields.value(i))
            .unwrap_or(u64::MAX);
        let failed = self
            .options
            .ret_field
            .and_then(|i| second.fields.value(i))
            .is_some_and(|ret| (ret as i64) < 0);

        self.table.upsert(id, |row| {
            row.latency.record(latency_ns);
            if failed {
                row.errors += 1;
            }
        });
    }

    fn print_header(&self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        frame.push(format!(
            "[{}] {:<20} {:>10} {:>14} {:>12} {:>12} {:>8}",
            ctx.id, "SYSCALL", "calls", "total(us)", "avg(us)", "max(us)", "errors"
        ));
    }

    fn print(&mut self, ctx: &PrintContext<'_>, frame: &mut Frame) {
        let order = &self.order;
        let first_n = self.options.first_n;
        let id = ctx.id;
        let mut printed = 0usize;
        self.cycle.run(
            &mut self.table,
            |ka, a, kb, b| {
                order.compare_keyed(
                    ka,
                    &[a.latency.count(), a.latency.sum(), a.errors],
                    kb,
                    &[b.latency.count(), b.latency.sum(), b.errors],
                )
            },
            |nr, row| {
                if first_n != 0 && printed >= first_n {
                    return;
                }
                printed += 1;
                frame.push(format!(
                    "[{}] {:<20} {:>10} {:>14} {:>12} {:>12} {:>8}",
                    id,
                    syscall_name(*nr),
                    row.latency.count(),
                    format_us(row.latency.sum() as f64),
                    format_us(row.latency.avg()),
                    format_us(row.latency.max() as f64),
                    row.errors,
                ));
            },
        );
    }
}
