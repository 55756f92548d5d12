//! Composite nodes: sequence, first-match and fragment inclusion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{NodeResult, Outcome, PolicyNode, ReleaseLatch, run_child, run_due_deferred, run_isolated};
use crate::context::ExecutionContext;

// ============================================================================
// AllNode
// ============================================================================

/// Runs children in order and stops at the first stop outcome.
///
/// Deferred checks that became due while a child ran (typically a routing
/// node advancing the phase) are run before the next child.
pub struct AllNode {
    name: String,
    children: Vec<Arc<dyn PolicyNode>>,
    latch: ReleaseLatch,
}

impl AllNode {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn PolicyNode>>) -> Self {
        Self {
            name: name.into(),
            children,
            latch: ReleaseLatch::new(),
        }
    }
}

#[async_trait]
impl PolicyNode for AllNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        for child in &self.children {
            let outcome = run_child(child.as_ref(), ctx).await;
            if outcome.is_stop() {
                trace!(node = %self.name, child = child.name(), outcome = %outcome, "Branch stopped");
                return Ok(outcome);
            }
            let deferred = run_due_deferred(ctx).await;
            if deferred.is_stop() {
                return Ok(deferred);
            }
        }
        Ok(Outcome::Continue)
    }

    fn release(&self) {
        if self.latch.trip() {
            for child in &self.children {
                child.release();
            }
        }
    }
}

// ============================================================================
// OneOfNode
// ============================================================================

/// Runs children in order until one continues. When all stop, the last stop
/// outcome is returned; an empty node is falsified.
pub struct OneOfNode {
    name: String,
    children: Vec<Arc<dyn PolicyNode>>,
    latch: ReleaseLatch,
}

impl OneOfNode {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn PolicyNode>>) -> Self {
        Self {
            name: name.into(),
            children,
            latch: ReleaseLatch::new(),
        }
    }
}

#[async_trait]
impl PolicyNode for OneOfNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        let mut last = Outcome::Falsified;
        for child in &self.children {
            last = run_child(child.as_ref(), ctx).await;
            if last.is_continue() {
                return Ok(Outcome::Continue);
            }
        }
        Ok(last)
    }

    fn release(&self) {
        if self.latch.trip() {
            for child in &self.children {
                child.release();
            }
        }
    }
}

// ============================================================================
// IncludeNode
// ============================================================================

/// Runs a named fragment in a child context.
///
/// Only the `imports` variables are visible to the fragment and only the
/// `exports` variables come back. Aborts and panics inside the fragment are
/// caught here; `remap` then re-classifies the fragment's outcome.
pub struct IncludeNode {
    name: String,
    fragment: String,
    body: Arc<dyn PolicyNode>,
    imports: Vec<String>,
    exports: Vec<String>,
    remap: HashMap<Outcome, Outcome>,
    latch: ReleaseLatch,
}

impl IncludeNode {
    pub fn new(fragment: impl Into<String>, body: Arc<dyn PolicyNode>) -> Self {
        let fragment = fragment.into();
        Self {
            name: format!("include:{fragment}"),
            fragment,
            body,
            imports: Vec::new(),
            exports: Vec::new(),
            remap: HashMap::new(),
            latch: ReleaseLatch::new(),
        }
    }

    #[must_use]
    pub fn with_imports(mut self, imports: Vec<String>) -> Self {
        self.imports = imports;
        self
    }

    #[must_use]
    pub fn with_exports(mut self, exports: Vec<String>) -> Self {
        self.exports = exports;
        self
    }

    #[must_use]
    pub fn with_remap(mut self, remap: HashMap<Outcome, Outcome>) -> Self {
        self.remap = remap;
        self
    }
}

#[async_trait]
impl PolicyNode for IncludeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        let mut child = ctx.spawn_child(&self.imports);
        let outcome = run_isolated(self.body.as_ref(), &mut child).await;
        ctx.absorb_child(child, &self.exports);

        let remapped = self.remap.get(&outcome).copied().unwrap_or(outcome);
        if remapped != outcome {
            debug!(
                request_id = %ctx.request_id(),
                fragment = %self.fragment,
                from = %outcome,
                to = %remapped,
                "Fragment outcome remapped"
            );
        }
        Ok(remapped)
    }

    fn release(&self) {
        // Fragments are shared between includes; the tree releases them.
        self.latch.trip();
    }
}
