//! Routing result notifications.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};

use crate::context::ExecutionContext;

/// Observer of per-attempt routing results.
///
/// Every method has a no-op default so implementations only override what
/// they care about. Listeners run inline on the exchange's task and must not
/// block.
pub trait RoutingResultListener: Send + Sync {
    /// A backend answered (any status).
    fn routed(&self, _url: &str, _status: StatusCode, _headers: &HeaderMap, _ctx: &ExecutionContext) {}

    /// An attempt failed before a response arrived.
    fn failed(&self, _url: &str, _cause: &str, _ctx: &ExecutionContext) {}

    /// Asked after a non-200 answer; returning `true` retries the same URL
    /// once more.
    fn reroute(&self, _url: &str, _status: StatusCode, _headers: &HeaderMap, _ctx: &ExecutionContext) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RoutingResultListener for NoopListener {}

/// Fans notifications out to several listeners in order.
#[derive(Default, Clone)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn RoutingResultListener>>,
}

impl CompositeListener {
    pub fn new(listeners: Vec<Arc<dyn RoutingResultListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn RoutingResultListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl RoutingResultListener for CompositeListener {
    fn routed(&self, url: &str, status: StatusCode, headers: &HeaderMap, ctx: &ExecutionContext) {
        for listener in &self.listeners {
            listener.routed(url, status, headers, ctx);
        }
    }

    fn failed(&self, url: &str, cause: &str, ctx: &ExecutionContext) {
        for listener in &self.listeners {
            listener.failed(url, cause, ctx);
        }
    }

    /// Every listener is asked, even after one has already said yes.
    fn reroute(&self, url: &str, status: StatusCode, headers: &HeaderMap, ctx: &ExecutionContext) -> bool {
        self.listeners
            .iter()
            .fold(false, |any, l| l.reroute(url, status, headers, ctx) || any)
    }
}
