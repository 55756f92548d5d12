//! Sticky (ordered) failover.

use std::time::Duration;

use parking_lot::Mutex;

use super::{Candidate, FailoverStrategy, Roster};

#[derive(Debug)]
struct State<T: Candidate> {
    roster: Roster<T>,
    preferred: usize,
}

/// Stays on the last candidate that succeeded. When it fails, moves to the
/// next available candidate in list order.
#[derive(Debug)]
pub struct StickyStrategy<T: Candidate> {
    state: Mutex<State<T>>,
}

impl<T: Candidate> StickyStrategy<T> {
    pub fn new(candidates: Vec<T>, retry_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                roster: Roster::new(candidates, retry_interval),
                preferred: 0,
            }),
        }
    }
}

impl<T: Candidate> FailoverStrategy<T> for StickyStrategy<T> {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(&self) -> Option<T> {
        let state = self.state.lock();
        let available = state.roster.available();
        let n = state.roster.len();
        // First available at or after the preferred position, wrapping.
        let pick = (0..n)
            .map(|offset| (state.preferred + offset) % n)
            .find(|i| available.contains(i))?;
        state.roster.get(pick).cloned()
    }

    fn report_success(&self, candidate: &T) {
        let mut state = self.state.lock();
        if let Some(i) = state.roster.succeed(candidate) {
            state.preferred = i;
        }
    }

    fn report_failure(&self, candidate: &T) {
        self.state.lock().roster.fail(candidate);
    }

    fn len(&self) -> usize {
        self.state.lock().roster.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::DEFAULT_RETRY_INTERVAL;

    fn strategy() -> StickyStrategy<&'static str> {
        StickyStrategy::new(vec!["a", "b", "c"], DEFAULT_RETRY_INTERVAL)
    }

    #[test]
    fn starts_with_first_and_sticks_after_success() {
        let s = strategy();
        assert_eq!(s.select(), Some("a"));
        s.report_success(&"c");
        assert_eq!(s.select(), Some("c"));
        assert_eq!(s.select(), Some("c"));
    }

    #[test]
    fn moves_on_after_failure_and_exhausts() {
        let s = strategy();
        s.report_failure(&"a");
        assert_eq!(s.select(), Some("b"));
        s.report_failure(&"b");
        assert_eq!(s.select(), Some("c"));
        s.report_failure(&"c");
        assert_eq!(s.select(), None);
    }

    #[test]
    fn wraps_from_preferred() {
        let s = strategy();
        s.report_success(&"b");
        s.report_failure(&"b");
        s.report_failure(&"c");
        assert_eq!(s.select(), Some("a"));
    }
}
