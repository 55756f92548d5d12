//! The outermost policy boundary for one service.

use std::sync::Arc;

use tracing::{debug, info};

use super::{Outcome, PolicyNode, ReleaseLatch, run_due_deferred, run_isolated};
use crate::context::ExecutionContext;

/// A service's root node plus every fragment it references.
///
/// [`PolicyTree::run`] is where aborts and panics stop. Nothing a node does
/// can escape past it: the caller always gets an [`Outcome`] and the context
/// is always torn down.
pub struct PolicyTree {
    service: String,
    root: Arc<dyn PolicyNode>,
    fragments: Vec<Arc<dyn PolicyNode>>,
    latch: ReleaseLatch,
}

impl PolicyTree {
    pub fn new(service: impl Into<String>, root: Arc<dyn PolicyNode>) -> Self {
        Self {
            service: service.into(),
            root,
            fragments: Vec::new(),
            latch: ReleaseLatch::new(),
        }
    }

    /// Attach fragment bodies so that [`PolicyTree::release`] retires them.
    #[must_use]
    pub fn with_fragments(mut self, fragments: Vec<Arc<dyn PolicyNode>>) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run the exchange to completion.
    ///
    /// Deferred checks that became due are run after the root; checks whose
    /// phase was never reached are dropped. Cleanup callbacks run before
    /// returning, whatever the outcome.
    #[tracing::instrument(skip_all, fields(service = %self.service, request_id = %ctx.request_id()))]
    pub async fn run(&self, ctx: &mut ExecutionContext) -> Outcome {
        let mut outcome = run_isolated(self.root.as_ref(), ctx).await;
        if outcome.is_continue() {
            outcome = run_due_deferred(ctx).await;
        }

        let skipped = ctx.pending_deferred();
        if skipped > 0 {
            debug!(skipped, phase = %ctx.routing_phase(), "Deferred checks never became due");
        }

        ctx.close();
        info!(
            outcome = %outcome,
            phase = %ctx.routing_phase(),
            elapsed_ms = ctx.variable("request.elapsed").map(|v| v.to_string()).unwrap_or_default(),
            "Exchange finished"
        );
        outcome
    }

    /// Retire every node in the tree. Idempotent.
    pub fn release(&self) {
        if self.latch.trip() {
            self.root.release();
            for fragment in &self.fragments {
                fragment.release();
            }
            debug!(service = %self.service, "Policy tree released");
        }
    }
}

impl Drop for PolicyTree {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoutingPhase;
    use crate::message::Message;
    use crate::policy::test_nodes::*;
    use crate::policy::{AllNode, NodeResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RegistersCleanup(Arc<AtomicBool>);

    #[async_trait]
    impl PolicyNode for RegistersCleanup {
        fn name(&self) -> &str {
            "registers-cleanup"
        }
        async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
            let flag = Arc::clone(&self.0);
            ctx.on_close(move || flag.store(true, Ordering::SeqCst));
            Ok(Outcome::Continue)
        }
    }

    struct DefersThenRoutes(Arc<Fixed>);

    #[async_trait]
    impl PolicyNode for DefersThenRoutes {
        fn name(&self) -> &str {
            "defers"
        }
        async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
            ctx.defer(RoutingPhase::Routed, self.0.clone());
            ctx.advance_routing_phase(RoutingPhase::Routed);
            Ok(Outcome::Continue)
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Message::new(), Message::new())
    }

    #[tokio::test]
    async fn panic_becomes_server_error_and_cleanup_runs() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let root = AllNode::new(
            "root",
            vec![node(RegistersCleanup(Arc::clone(&cleaned))), node(Panicking)],
        );
        let tree = PolicyTree::new("svc", Arc::new(root));
        let mut ctx = ctx();
        assert_eq!(tree.run(&mut ctx).await, Outcome::ServerError);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn root_abort_becomes_outcome() {
        let tree = PolicyTree::new("svc", Arc::new(Aborting(Outcome::AuthRequired)));
        let mut ctx = ctx();
        assert_eq!(tree.run(&mut ctx).await, Outcome::AuthRequired);
    }

    #[tokio::test]
    async fn deferred_check_runs_after_root() {
        let check = Fixed::new(Outcome::Unauthorized);
        let tree = PolicyTree::new("svc", Arc::new(DefersThenRoutes(check.clone())));
        let mut ctx = ctx();
        assert_eq!(tree.run(&mut ctx).await, Outcome::Unauthorized);
        assert_eq!(check.runs(), 1);
    }

    #[test]
    fn release_reaches_fragments_once() {
        let root = Fixed::new(Outcome::Continue);
        let fragment = Fixed::new(Outcome::Continue);
        let tree = PolicyTree::new("svc", shared(&root)).with_fragments(vec![shared(&fragment)]);
        tree.release();
        drop(tree);
        assert_eq!(root.releases(), 1);
        assert_eq!(fragment.releases(), 1);
    }
}
