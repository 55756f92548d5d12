//! Outbound dispatch engine.
//!
//! Routing nodes forward the exchange's request to a backend and write the
//! backend's answer into the response message (or a message variable). Two
//! transports ship with the core:
//!
//! - [`http::HttpRoutingNode`] over `reqwest`
//! - [`queue::QueueRoutingNode`] over the [`queue::QueueConnector`] seam
//!
//! Both drive the same transport-agnostic failover loop in [`dispatch`].
//!
//! ## Attempt Flow
//!
//! ```text
//! routing_started() ─► guard
//!     │
//!     ▼
//! candidate = single endpoint | strategy.select()
//!     │
//!     ▼
//! attempt(candidate) ──► Success ──► report_success ──► Continue
//!     │
//!     ├─► Retryable ──► report_failure, blacklist += candidate, next
//!     └─► Terminal ───► report_failure, blacklist += candidate, stop
//! ```
//!
//! # Dependencies
//!
//! Collaborators are injected through [`RoutingServices`]; nothing in this
//! module reaches for a process-wide singleton.

pub mod dispatch;
pub mod endpoint;
pub mod http;
pub mod identity;
pub mod listener;
pub mod queue;
pub mod rules;
pub mod security_header;

use std::fmt;
use std::sync::Arc;

use tracing::{error, warn};

use crate::context::{ExecutionContext, TemplateExpander, Value, VariableExpander};
use crate::policy::Outcome;
use crate::stash::{StashFactory, default_factory};

pub use dispatch::{AttemptDispatcher, AttemptResult, run_failover};
pub use endpoint::EndpointSet;
pub use identity::{AssertionSigner, SignedAssertion, SigningError};
pub use listener::{CompositeListener, NoopListener, RoutingResultListener};
pub use rules::{ForwardingMode, ForwardingRule, RuleEnforcer, StandardRuleEnforcer};
pub use security_header::SecurityHeaderAction;

/// Collaborators handed to routing nodes at construction.
#[derive(Clone)]
pub struct RoutingServices {
    pub stash_factory: Arc<dyn StashFactory>,
    pub expander: Arc<dyn VariableExpander>,
    pub rule_enforcer: Arc<dyn RuleEnforcer>,
    pub listener: Arc<dyn RoutingResultListener>,
    /// Issues sender-vouches assertions; `None` when no signing key is
    /// configured.
    pub signer: Option<Arc<dyn AssertionSigner>>,
}

impl Default for RoutingServices {
    fn default() -> Self {
        Self {
            stash_factory: default_factory(),
            expander: Arc::new(TemplateExpander::lenient()),
            rule_enforcer: Arc::new(StandardRuleEnforcer),
            listener: Arc::new(NoopListener),
            signer: None,
        }
    }
}

impl fmt::Debug for RoutingServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingServices")
            .field("stash_factory", &self.stash_factory)
            .field("expander", &self.expander)
            .field("rule_enforcer", &self.rule_enforcer)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

impl RoutingServices {
    #[must_use]
    pub fn with_stash_factory(mut self, factory: Arc<dyn StashFactory>) -> Self {
        self.stash_factory = factory;
        self
    }

    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn VariableExpander>) -> Self {
        self.expander = expander;
        self
    }

    #[must_use]
    pub fn with_rule_enforcer(mut self, enforcer: Arc<dyn RuleEnforcer>) -> Self {
        self.rule_enforcer = enforcer;
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RoutingResultListener>) -> Self {
        self.listener = listener;
        self
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn AssertionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Machine-readable reason for a failed dispatch, published in the
/// `*.failureReason` variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    HostNotFound,
    BadUrl,
    ConnectTimeout,
    ReadTimeout,
    /// Queue reply never arrived.
    NoResponse,
    /// Queue request over the message ceiling.
    MessageTooLarge,
    Undefined,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostNotFound => "host-not-found",
            Self::BadUrl => "bad-url",
            Self::ConnectTimeout => "connect-timeout",
            Self::ReadTimeout => "read-timeout",
            Self::NoResponse => "no-response",
            Self::MessageTooLarge => "message-too-large",
            Self::Undefined => "undefined",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set a routing-owned variable. Routing variable names are never built-ins,
/// so the write cannot be refused.
pub(crate) fn publish(ctx: &mut ExecutionContext, name: &str, value: impl Into<Value>) {
    if let Err(e) = ctx.set_variable(name, value) {
        warn!(variable = %name, error = %e, "Routing variable not published");
    }
}

/// Apply the security-header relay to the message in `source`, then attach
/// a sender-vouches assertion for the authenticated caller when
/// `assert_identity` is set. Both transports run this before forwarding.
pub(crate) fn prepare_security(
    ctx: &mut ExecutionContext,
    source: &str,
    action: &SecurityHeaderAction,
    assert_identity: bool,
    signer: Option<&dyn AssertionSigner>,
) -> Result<(), Outcome> {
    let subject = ctx.last_authentication().cloned();
    let message = ctx.message_variable_mut(source).map_err(|e| {
        warn!(variable = %source, error = %e, "Request source message unavailable");
        Outcome::ServerError
    })?;
    if let Err(e) = action.apply(message) {
        warn!(error = %e, "Security header relay failed");
        return Err(Outcome::BadRequest);
    }
    if assert_identity
        && let Some(subject) = &subject
    {
        let Some(signer) = signer else {
            error!("Identity assertion configured but no signer available");
            return Err(Outcome::ServerError);
        };
        let assertion = signer.issue(subject).map_err(|e| {
            error!(error = %e, "Identity assertion not issued");
            Outcome::ServerError
        })?;
        if let Err(e) = identity::attach_assertion(message, &assertion) {
            warn!(error = %e, "Identity assertion not attached");
            return Err(Outcome::Falsified);
        }
    }
    Ok(())
}
