//! Transport-agnostic failover loop.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::endpoint::EndpointSet;
use super::publish;
use crate::context::{ExecutionContext, Value};
use crate::failover::Candidate;
use crate::policy::Outcome;

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// The backend answered and the answer was accepted.
    Success,
    /// Failed before anything irreversible happened; another candidate may
    /// be tried.
    Retryable(Outcome),
    /// Failed after a point of no return (message sent, bytes streamed to
    /// the caller) or for a reason another candidate cannot fix.
    Terminal(Outcome),
}

/// One transport's per-attempt logic.
#[async_trait]
pub trait AttemptDispatcher<T: Candidate>: Send + Sync {
    async fn attempt(&self, candidate: &T, ctx: &mut ExecutionContext) -> AttemptResult;
}

/// Run attempts until one succeeds, a terminal failure occurs, the strategy
/// is exhausted, or `endpoints.max_attempts()` attempts were made.
///
/// Each failed candidate, terminal or not, is reported to the strategy and
/// appended to the list variable `blacklist_var`.
/// With a single endpoint the attempt's own outcome is returned; with a
/// strategy, running out of candidates gives [`Outcome::Failed`].
pub async fn run_failover<T: Candidate>(
    endpoints: &EndpointSet<T>,
    dispatcher: &dyn AttemptDispatcher<T>,
    ctx: &mut ExecutionContext,
    blacklist_var: &str,
) -> Outcome {
    let strategy = match endpoints {
        EndpointSet::Single(candidate) => {
            return match dispatcher.attempt(candidate, ctx).await {
                AttemptResult::Success => Outcome::Continue,
                AttemptResult::Retryable(outcome) | AttemptResult::Terminal(outcome) => {
                    publish(ctx, blacklist_var, Value::List(vec![candidate.to_string()]));
                    outcome
                }
            };
        }
        EndpointSet::Failover(strategy) => strategy,
    };

    let max_attempts = endpoints.max_attempts();
    let mut blacklist: Vec<String> = Vec::new();

    for attempt in 0..max_attempts {
        let Some(candidate) = strategy.select() else {
            warn!(request_id = %ctx.request_id(), attempt, "Failover strategy exhausted");
            break;
        };
        if let Some(previous) = blacklist.last() {
            debug!(from = %previous, to = %candidate, "Failing over");
        }

        match dispatcher.attempt(&candidate, ctx).await {
            AttemptResult::Success => {
                strategy.report_success(&candidate);
                return Outcome::Continue;
            }
            AttemptResult::Retryable(outcome) => {
                strategy.report_failure(&candidate);
                blacklist.push(candidate.to_string());
                publish(ctx, blacklist_var, Value::List(blacklist.clone()));
                debug!(candidate = %candidate, attempt, outcome = %outcome, "Attempt failed");
            }
            AttemptResult::Terminal(outcome) => {
                strategy.report_failure(&candidate);
                blacklist.push(candidate.to_string());
                publish(ctx, blacklist_var, Value::List(blacklist.clone()));
                return outcome;
            }
        }
    }

    error!(
        request_id = %ctx.request_id(),
        attempts = blacklist.len(),
        "Too many failed routing attempts"
    );
    Outcome::Failed
}
