//! Round-robin failover.

use std::time::Duration;

use parking_lot::Mutex;

use super::{Candidate, FailoverStrategy, Roster};

#[derive(Debug)]
struct State<T: Candidate> {
    roster: Roster<T>,
    next: usize,
    last: Option<usize>,
}

/// Rotates through available candidates. The candidate just handed out is
/// only repeated when it is the only one available.
#[derive(Debug)]
pub struct RoundRobinStrategy<T: Candidate> {
    state: Mutex<State<T>>,
}

impl<T: Candidate> RoundRobinStrategy<T> {
    pub fn new(candidates: Vec<T>, retry_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                roster: Roster::new(candidates, retry_interval),
                next: 0,
                last: None,
            }),
        }
    }
}

impl<T: Candidate> FailoverStrategy<T> for RoundRobinStrategy<T> {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self) -> Option<T> {
        let mut state = self.state.lock();
        let available = state.roster.available();
        let n = state.roster.len();
        let (next, last) = (state.next, state.last);
        let alone = available.len() <= 1;

        let pick = (0..n)
            .map(|offset| (next + offset) % n)
            .filter(|i| alone || Some(*i) != last)
            .find(|i| available.contains(i))?;

        state.next = (pick + 1) % n;
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
