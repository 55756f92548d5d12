//! Per-exchange execution context.
//!
//! An [`ExecutionContext`] is created for every inbound exchange and for
//! every nested sub-policy run. It owns the exchange's default request and
//! response messages, its variables, the routing phase, authentication
//! results, deferred checks and cleanup callbacks.
//!
//! # Ownership
//!
//! A context is owned by the single task processing its exchange and is
//! never shared. A child context created for a sub-policy keeps a read-only
//! link to its parent's lineage; variables cross the boundary only through
//! [`ExecutionContext::spawn_child`] (import) and
//! [`ExecutionContext::absorb_child`] (export).
//!
//! # Teardown
//!
//! Cleanup callbacks registered with [`ExecutionContext::on_close`] run
//! exactly once, in reverse registration order, when the context is closed
//! or dropped. That covers every error path including panics unwinding
//! through the owner.

pub mod auth;
pub mod expand;
pub mod routing;
pub mod variables;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::message::Message;
use crate::policy::PolicyNode;

pub use auth::{AuthenticationResult, CredentialKind};
pub use expand::{TemplateExpander, VariableExpander, VariableSource};
pub use routing::{RoutingGuard, RoutingPhase, RoutingStats};
pub use variables::{Value, VariableError, VariableMap};

use expand::{message_attribute, split_message_reference};
use routing::RoutingClock;

/// Read-only built-in variable names.
pub const BUILTIN_VARIABLES: &[&str] = &[
    "request",
    "response",
    "request.id",
    "request.elapsed",
    "request.authenticated",
    "request.authenticated.user",
    "routing.phase",
];

fn is_builtin(name: &str) -> bool {
    BUILTIN_VARIABLES
        .iter()
        .any(|b| b.eq_ignore_ascii_case(name))
}

/// Identity of a context's ancestors.
#[derive(Debug)]
pub struct Lineage {
    pub request_id: Uuid,
    pub depth: usize,
    pub parent: Option<Arc<Lineage>>,
}

/// A check that waits for the routing phase to reach `after`.
pub struct DeferredCheck {
    pub after: RoutingPhase,
    pub node: Arc<dyn PolicyNode>,
}

impl fmt::Debug for DeferredCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCheck")
            .field("after", &self.after)
            .field("node", &self.node.name())
            .finish()
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Mutable state for one exchange.
pub struct ExecutionContext {
    request_id: Uuid,
    started_at: Instant,
    request: Message,
    response: Message,
    variables: VariableMap,
    phase: RoutingPhase,
    clock: Arc<RoutingClock>,
    authentications: Vec<AuthenticationResult>,
    deferred: Vec<DeferredCheck>,
    cleanups: Mutex<Vec<Cleanup>>,
    lineage: Arc<Lineage>,
    reply_expected: bool,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("request_id", &self.request_id)
            .field("phase", &self.phase)
            .field("depth", &self.lineage.depth)
            .field("variables", &self.variables.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl ExecutionContext {
    /// Create the root context for an inbound exchange.
    pub fn new(request: Message, response: Message) -> Self {
        let request_id = Uuid::new_v4();
        Self::with_lineage(
            request,
            response,
            Arc::new(Lineage {
                request_id,
                depth: 0,
                parent: None,
            }),
        )
    }

    fn with_lineage(request: Message, response: Message, lineage: Arc<Lineage>) -> Self {
        Self {
            request_id: lineage.request_id,
            started_at: Instant::now(),
            request,
            response,
            variables: VariableMap::new(),
            phase: RoutingPhase::NotStarted,
            clock: Arc::new(RoutingClock::default()),
            authentications: Vec::new(),
            deferred: Vec::new(),
            cleanups: Mutex::new(Vec::new()),
            lineage,
            reply_expected: true,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Nesting depth; zero for the root context.
    pub fn depth(&self) -> usize {
        self.lineage.depth
    }

    pub fn lineage(&self) -> &Arc<Lineage> {
        &self.lineage
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Message {
        &mut self.request
    }

    pub fn response(&self) -> &Message {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Message {
        &mut self.response
    }

    /// Whether the caller waits for a reply. One-way exchanges skip reply
    /// handling in queue routing.
    pub fn is_reply_expected(&self) -> bool {
        self.reply_expected
    }

    pub fn set_reply_expected(&mut self, expected: bool) {
        self.reply_expected = expected;
    }

    // ------------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------------

    /// Read a variable, including computed built-ins.
    ///
    /// # Errors
    ///
    /// - [`VariableError::NoSuchVariable`] when undefined
    /// - [`VariableError::WrongType`] for message-valued variables; use
    ///   [`ExecutionContext::message_variable`]
    pub fn variable(&self, name: &str) -> Result<Value, VariableError> {
        if let Some(value) = self.builtin(name) {
            return Ok(value);
        }
        if let Some(value) = self.variables.get(name) {
            return Ok(value.clone());
        }
        if self.variables.message(name).is_some() || is_message_builtin(name) {
            return Err(VariableError::WrongType {
                name: name.to_string(),
                expected: "scalar value",
            });
        }
        Err(VariableError::NoSuchVariable {
            name: name.to_string(),
        })
    }

    /// Set a variable. Names need not be declared anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`VariableError::NotSettable`] for built-ins.
    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) -> Result<(), VariableError> {
        if is_builtin(name) {
            return Err(VariableError::NotSettable {
                name: name.to_string(),
            });
        }
        self.variables.set(name, value);
        Ok(())
    }

    /// Store a message under a variable name.
    pub fn set_message_variable(&mut self, name: &str, message: Message) -> Result<(), VariableError> {
        if is_builtin(name) {
            return Err(VariableError::NotSettable {
                name: name.to_string(),
            });
        }
        self.variables.set_message(name, message);
        Ok(())
    }

    /// Resolve a message by variable name; `request` and `response` name the
    /// default messages.
    pub fn message_variable(&self, name: &str) -> Result<&Message, VariableError> {
        if name.eq_ignore_ascii_case("request") {
            return Ok(&self.request);
        }
        if name.eq_ignore_ascii_case("response") {
            return Ok(&self.response);
        }
        self.variables
            .message(name)
            .ok_or_else(|| VariableError::NoSuchVariable {
                name: name.to_string(),
            })
    }

    pub fn message_variable_mut(&mut self, name: &str) -> Result<&mut Message, VariableError> {
        if name.eq_ignore_ascii_case("request") {
            return Ok(&mut self.request);
        }
        if name.eq_ignore_ascii_case("response") {
            return Ok(&mut self.response);
        }
        self.variables
            .message_mut(name)
            .ok_or_else(|| VariableError::NoSuchVariable {
                name: name.to_string(),
            })
    }

    pub fn remove_variable(&mut self, name: &str) -> Result<bool, VariableError> {
        if is_builtin(name) {
            return Err(VariableError::NotSettable {
                name: name.to_string(),
            });
        }
        Ok(self.variables.remove(name))
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    /// Expand a template against this context.
    pub fn expand(
        &self,
        expander: &dyn VariableExpander,
        template: &str,
    ) -> Result<String, VariableError> {
        expander.expand(template, self)
    }

    fn builtin(&self, name: &str) -> Option<Value> {
        let lower = name.to_ascii_lowercase();
        Some(match lower.as_str() {
            "request.id" => Value::String(self.request_id.to_string()),
            "request.elapsed" => Value::Int(self.started_at.elapsed().as_millis() as i64),
            "request.authenticated" => Value::Bool(self.is_authenticated()),
            "request.authenticated.user" => {
                Value::String(self.last_authentication()?.user.clone())
            }
            "routing.phase" => Value::String(self.phase.as_str().to_string()),
            _ => return None,
        })
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    pub fn routing_phase(&self) -> RoutingPhase {
        self.phase
    }

    /// Advance the routing phase. Attempts to move backwards are ignored.
    pub fn advance_routing_phase(&mut self, phase: RoutingPhase) {
        if phase > self.phase {
            trace!(request_id = %self.request_id, from = %self.phase, to = %phase, "Routing phase advanced");
            self.phase = phase;
        }
    }

    /// Begin a dispatch cycle. The returned guard finishes the cycle exactly
    /// once, on [`RoutingGuard::finish`] or on drop.
    pub fn routing_started(&self) -> RoutingGuard {
        self.clock.start()
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.clock.stats()
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    pub fn add_authentication(&mut self, result: AuthenticationResult) {
        debug!(request_id = %self.request_id, user = %result.user, provider = %result.provider, "Caller authenticated");
        self.authentications.push(result);
    }

    pub fn authentications(&self) -> &[AuthenticationResult] {
        &self.authentications
    }

    pub fn last_authentication(&self) -> Option<&AuthenticationResult> {
        self.authentications.last()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.authentications.is_empty()
    }

    // ------------------------------------------------------------------------
    // Deferred checks
    // ------------------------------------------------------------------------

    /// Register `node` to run once the routing phase reaches `after`.
    pub fn defer(&mut self, after: RoutingPhase, node: Arc<dyn PolicyNode>) {
        self.deferred.push(DeferredCheck { after, node });
    }

    /// Remove and return the checks whose phase has been reached, in
    /// registration order. Each check is returned at most once.
    pub fn take_due_deferred(&mut self) -> Vec<Arc<dyn PolicyNode>> {
        let phase = self.phase;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| d.after <= phase);
        self.deferred = pending;
        due.into_iter().map(|d| d.node).collect()
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Register a callback for context teardown.
    pub fn on_close(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().push(Box::new(cleanup));
    }

    /// Run all pending cleanup callbacks now. Later calls (and drop) run only
    /// callbacks registered since. A panicking callback is logged and does
    /// not stop the others.
    pub fn close(&self) {
        let callbacks = std::mem::take(&mut *self.cleanups.lock());
        if callbacks.is_empty() {
            return;
        }
        trace!(request_id = %self.request_id, count = callbacks.len(), "Running context cleanup");
        for cleanup in callbacks.into_iter().rev() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                error!(request_id = %self.request_id, "Context cleanup callback panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Nesting
    // ------------------------------------------------------------------------

    /// Create a child context for a sub-policy.
    ///
    /// The exchange's default messages move into the child for the duration
    /// of the sub-policy and return through [`ExecutionContext::absorb_child`].
    /// Only the variables named in `imports` are copied in; message-valued
    /// variables are not imported.
    pub fn spawn_child(&mut self, imports: &[String]) -> ExecutionContext {
        let lineage = Arc::new(Lineage {
            request_id: self.request_id,
            depth: self.lineage.depth + 1,
            parent: Some(Arc::clone(&self.lineage)),
        });
        let mut child = ExecutionContext::with_lineage(
            std::mem::take(&mut self.request),
            std::mem::take(&mut self.response),
            lineage,
        );
        child.started_at = self.started_at;
        child.phase = self.phase;
        child.reply_expected = self.reply_expected;
        child.authentications = self.authentications.clone();

        for name in imports {
            if let Some(value) = self.variables.get(name) {
                child.variables.set(name, value.clone());
            } else {
                trace!(variable = %name, "Import skipped; variable not set in parent");
            }
        }
        child
    }

    /// Fold a finished child back in: messages return, the variables named
    /// in `exports` are copied out (message-valued ones are moved), the
    /// routing phase and authentications merge, and the child is closed.
    pub fn absorb_child(&mut self, mut child: ExecutionContext, exports: &[String]) {
        self.request = std::mem::take(&mut child.request);
        self.response = std::mem::take(&mut child.response);

        for name in exports {
            if is_builtin(name) {
                continue;
            }
            if let Some(value) = child.variables.get(name) {
                self.variables.set(name, value.clone());
            } else if let Some(message) = child.variables.take_message(name) {
                self.variables.set_message(name, message);
            }
        }

        self.advance_routing_phase(child.phase);
        for auth in child.authentications.drain(self.authentications.len().min(child.authentications.len())..) {
            self.authentications.push(auth);
        }
        // Deferred checks registered by the sub-policy stay with the exchange.
        self.deferred.append(&mut child.deferred);
        child.close();
    }
}

fn is_message_builtin(name: &str) -> bool {
    name.eq_ignore_ascii_case("request") || name.eq_ignore_ascii_case("response")
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl VariableSource for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<Vec<String>> {
        if let Some(value) = self.builtin(name) {
            return Some(value.to_strings());
        }
        if let Some(value) = self.variables.get(name) {
            return Some(value.to_strings());
        }
        let candidates = self
            .variables
            .message_keys()
            .map(str::to_string)
            .chain(["request".to_string(), "response".to_string()]);
        let (prefix, suffix) = split_message_reference(name, candidates)?;
        let message = self.message_variable(&prefix).ok()?;
        message_attribute(message, &suffix.to_ascii_lowercase())
    }
}
