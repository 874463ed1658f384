//! Debug-packet ring buffer, plus the ordinary `log`-facade call sites the rest of the
//! crate uses for non-protocol-tracing messages.
//!
//! Protocol tracing (raw packets, decoded `Fcall`s) is high-volume and only wanted when
//! actively debugging a session, so it's kept out of the `log` facade entirely and
//! routed through a small bounded ring buffer instead: `trace_packet`/`trace_fcall` are
//! cheap no-ops unless the matching bit is set in the connection's [`Debuglevel`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

bitflags::bitflags! {
    /// Which categories of debug trace to collect.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Debuglevel: u32 {
        /// Log raw wire packets as they're read/written.
        const LOG_PACKETS   = 0x1;
        /// Log decoded `Fcall`s as they're dispatched.
        const LOG_FCALLS    = 0x2;
        /// Additionally print packets to the trace sink immediately, not just buffer them.
        const PRINT_PACKETS = 0x4;
        /// Additionally print fcalls to the trace sink immediately.
        const PRINT_FCALLS  = 0x8;
    }
}

/// One entry in the trace ring buffer.
#[derive(Debug, Clone)]
pub struct Trace {
    pub direction: Direction,
    pub tag: u16,
    pub detail: String,
}

/// Which way a traced message was moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Sent => "->",
            Direction::Received => "<-",
        };
        write!(f, "[{:04x}] {} {}", self.tag, arrow, self.detail)
    }
}

/// A fixed-capacity ring buffer of [`Trace`] entries, shared by every task on a
/// connection via `Arc`.
///
/// `push` never blocks and never grows unbounded: once `capacity` is reached, the
/// oldest entry is dropped to make room, the same trade a production server makes
/// between keeping enough history to be useful and bounding memory under load.
pub struct TraceLog {
    capacity: usize,
    level: Debuglevel,
    entries: Mutex<VecDeque<Trace>>,
}

impl TraceLog {
    pub fn new(capacity: usize, level: Debuglevel) -> TraceLog {
        TraceLog { capacity, level, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn level(&self) -> Debuglevel {
        self.level
    }

    /// Record a packet trace if `LOG_PACKETS` is enabled; print it too if
    /// `PRINT_PACKETS` is also set.
    pub fn trace_packet(&self, direction: Direction, tag: u16, bytes: usize) {
        if !self.level.contains(Debuglevel::LOG_PACKETS) {
            return;
        }
        self.push(Trace { direction, tag, detail: format!("{} byte packet", bytes) });
    }

    /// Record an fcall trace if `LOG_FCALLS` is enabled; print it too if
    /// `PRINT_FCALLS` is also set.
    pub fn trace_fcall(&self, direction: Direction, tag: u16, fcall: &crate::fcall::Fcall) {
        if !self.level.contains(Debuglevel::LOG_FCALLS) {
            return;
        }
        self.push(Trace { direction, tag, detail: format!("{:?}", fcall) });
    }

    fn push(&self, trace: Trace) {
        let print = self.level.intersects(Debuglevel::PRINT_PACKETS | Debuglevel::PRINT_FCALLS);
        if print {
            log::debug!("{}", trace);
        }
        let mut entries = self.entries.lock().expect("trace log mutex poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(trace);
    }

    /// Snapshot of the current buffer contents, oldest first.
    pub fn snapshot(&self) -> Vec<Trace> {
        self.entries.lock().expect("trace log mutex poisoned").iter().cloned().collect()
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        TraceLog::new(256, Debuglevel::empty())
    }
}
