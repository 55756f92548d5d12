//! Random failover.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use super::{Candidate, FailoverStrategy, Roster};

#[derive(Debug)]
struct State<T: Candidate> {
    roster: Roster<T>,
    last: Option<usize>,
}

/// Picks uniformly among available candidates, avoiding the previous pick
/// while another candidate is available.
#[derive(Debug)]
pub struct RandomStrategy<T: Candidate> {
    state: Mutex<State<T>>,
}

impl<T: Candidate> RandomStrategy<T> {
    pub fn new(candidates: Vec<T>, retry_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                roster: Roster::new(candidates, retry_interval),
                last: None,
            }),
        }
    }
}

impl<T: Candidate> FailoverStrategy<T> for RandomStrategy<T> {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self) -> Option<T> {
        let mut state = self.state.lock();
        let mut available = state.roster.available();
        if available.len() > 1 {
            let last = state.last;
            available.retain(|i| Some(*i) != last);
        }
        if available.is_empty() {
            return None;
        }
        let pick = available[rand::rng().random_range(0..available.len())];
        state.last = Some(pick);
        state.roster.get(pick).cloned()
    }

    fn report_success(&self, candidate: &T) {
        self.state.lock().roster.succeed(candidate);
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

    #[test]
    fn only_available_candidates_are_picked() {
        let s = RandomStrategy::new(vec!["a", "b", "c"], DEFAULT_RETRY_INTERVAL);
        s.report_failure(&"b");
        for _ in 0..50 {
            assert_ne!(s.select(), Some("b"));
        }
    }

    #[test]
    fn never_repeats_while_alternatives_exist() {
        let s = RandomStrategy::new(vec!["a", "b"], DEFAULT_RETRY_INTERVAL);
        let mut prev = s.select();
        for _ in 0..50 {
            let next = s.select();
            assert_ne!(next, prev);
            prev = next;
        }
    }

    #[test]
    fn exhausted() {
        let s = RandomStrategy::new(vec!["a"], DEFAULT_RETRY_INTERVAL);
        s.report_failure(&"a");
        assert_eq!(s.select(), None);
    }
}
