//! Routing phase tracking and the scoped routing guard.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// How far the exchange has progressed toward its backend.
///
/// The phase only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoutingPhase {
    NotStarted,
    /// At least one dispatch attempt was made.
    Attempted,
    /// A backend response was accepted.
    Routed,
}

impl RoutingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Attempted => "attempted",
            Self::Routed => "routed",
        }
    }
}

impl fmt::Display for RoutingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the routing bookkeeping for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingStats {
    pub started: u32,
    pub finished: u32,
    pub total_latency: Duration,
}

impl RoutingStats {
    /// Cycles started but not yet finished.
    pub fn in_flight(&self) -> u32 {
        self.started.saturating_sub(self.finished)
    }
}

/// Shared counters behind [`RoutingGuard`]s.
#[derive(Debug, Default)]
pub(crate) struct RoutingClock {
    stats: Mutex<RoutingStats>,
}

impl RoutingClock {
    pub(crate) fn start(self: &Arc<Self>) -> RoutingGuard {
        self.stats.lock().started += 1;
        trace!("Routing cycle started");
        RoutingGuard {
            clock: Arc::clone(self),
            started_at: Instant::now(),
            finished: false,
        }
    }

    pub(crate) fn stats(&self) -> RoutingStats {
        *self.stats.lock()
    }

    fn finish(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.finished += 1;
        stats.total_latency += elapsed;
        trace!(elapsed_ms = elapsed.as_millis() as u64, "Routing cycle finished");
    }
}

/// Marks one dispatch cycle as in flight.
///
/// Created by `ExecutionContext::routing_started`. The cycle is finished
/// exactly once: either explicitly through [`RoutingGuard::finish`] or when
/// the guard is dropped on any other exit path.
#[must_use = "dropping the guard immediately finishes the routing cycle"]
pub struct RoutingGuard {
    clock: Arc<RoutingClock>,
    started_at: Instant,
    finished: bool,
}

impl RoutingGuard {
    /// Time since the cycle started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Finish the cycle and return its latency.
    pub fn finish(mut self) -> Duration {
        let elapsed = self.started_at.elapsed();
        self.finished = true;
        self.clock.finish(elapsed);
        elapsed
    }
}

impl Drop for RoutingGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.clock.finish(self.started_at.elapsed());
        }
    }
}

impl fmt::Debug for RoutingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingGuard")
            .field("elapsed", &self.started_at.elapsed())
            .field("finished", &self.finished)
            .finish()
    }
}
