//! Policy node contract and the composite nodes shipped with the core.
//!
//! Every check or transform implements [`PolicyNode`]: it runs against an
//! [`ExecutionContext`] and returns an [`Outcome`], or raises an
//! [`AbortSignal`] to unwind several call levels at once.
//!
//! ## Boundaries
//!
//! ```text
//! PolicyTree ── catches aborts + panics, runs deferred checks, closes context
//!   └─ AllNode ── converts child aborts, stops at first stop outcome
//!        ├─ IncludeNode ── child context, catches aborts + panics, remaps
//!        │    └─ fragment nodes...
//!        └─ HttpRoutingNode / QueueRoutingNode
//! ```
//!
//! # Thread Safety
//!
//! Nodes are shared by all concurrent exchanges of a service and must be
//! `Send + Sync`. Per-exchange state lives in the context, never in the node.

pub mod build;
pub mod builtin;
pub mod composite;
pub mod outcome;
pub mod tree;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::context::ExecutionContext;

pub use builtin::{RequireVariableNode, SetVariableNode, SizeLimitNode};
pub use composite::{AllNode, IncludeNode, OneOfNode};
pub use outcome::{AbortSignal, NodeResult, Outcome};
pub use tree::PolicyTree;

/// One check or transform in a policy tree.
#[async_trait]
pub trait PolicyNode: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run against one exchange.
    ///
    /// # Errors
    ///
    /// Returns an [`AbortSignal`] only for exceptional unwinding. Expected
    /// failures are reported as a stop [`Outcome`].
    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult;

    /// Retire the node and free its resources. Must be idempotent and must
    /// never panic.
    fn release(&self) {}
}

/// One-shot flag backing idempotent [`PolicyNode::release`] implementations.
#[derive(Debug, Default)]
pub struct ReleaseLatch(AtomicBool);

impl ReleaseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once: for the first caller.
    pub fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run a child node, converting an abort into its outcome.
pub async fn run_child(node: &dyn PolicyNode, ctx: &mut ExecutionContext) -> Outcome {
    match node.execute(ctx).await {
        Ok(outcome) => outcome,
        Err(abort) => {
            debug!(
                request_id = %ctx.request_id(),
                node = node.name(),
                outcome = %abort.outcome,
                reason = %abort.reason,
                "Node aborted"
            );
            abort.outcome
        }
    }
}

/// Run a node at an isolation boundary: aborts become their outcome and a
/// panic becomes [`Outcome::ServerError`].
pub async fn run_isolated(node: &dyn PolicyNode, ctx: &mut ExecutionContext) -> Outcome {
    let request_id = ctx.request_id();
    match AssertUnwindSafe(node.execute(ctx)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(abort)) => {
            warn!(
                request_id = %request_id,
                node = node.name(),
                outcome = %abort.outcome,
                reason = %abort.reason,
                "Abort caught at policy boundary"
            );
            abort.outcome
        }
        Err(panic) => {
            error!(
                request_id = %request_id,
                node = node.name(),
                panic = %panic_message(panic.as_ref()),
                "Policy node panicked"
            );
            Outcome::ServerError
        }
    }
}

/// Run every deferred check whose routing phase has been reached. Returns
/// the first stop outcome, or [`Outcome::Continue`].
pub async fn run_due_deferred(ctx: &mut ExecutionContext) -> Outcome {
    loop {
        let due = ctx.take_due_deferred();
        if due.is_empty() {
            return Outcome::Continue;
        }
        for node in due {
            let outcome = run_isolated(node.as_ref(), ctx).await;
            if outcome.is_stop() {
                debug!(
                    request_id = %ctx.request_id(),
                    node = node.name(),
                    outcome = %outcome,
                    "Deferred check stopped the exchange"
                );
                return outcome;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
pub(crate) mod test_nodes {
    //! Small nodes used by tests across the crate.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns a fixed outcome and counts executions and releases.
    #[derive(Default)]
    pub struct Fixed {
        pub outcome: Option<Outcome>,
        pub runs: AtomicUsize,
        pub releases: AtomicUsize,
    }

    impl Fixed {
        pub fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome: Some(outcome),
                ..Self::default()
            })
        }

        pub fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        pub fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicyNode for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> NodeResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.unwrap_or(Outcome::Continue))
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Erase a test node's type for use as a child.
    pub fn shared<N: PolicyNode + 'static>(node: &Arc<N>) -> Arc<dyn PolicyNode> {
        node.clone()
    }

    pub fn node<N: PolicyNode + 'static>(node: N) -> Arc<dyn PolicyNode> {
        Arc::new(node)
    }

    pub struct Aborting(pub Outcome);

    #[async_trait]
    impl PolicyNode for Aborting {
        fn name(&self) -> &str {
            "aborting"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> NodeResult {
            Err(AbortSignal::new(self.0, "deep failure"))
        }
    }

    pub struct Panicking;

    #[async_trait]
    impl PolicyNode for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> NodeResult {
            panic!("node defect");
        }
    }
}
