//! Queue routing node.
//!
//! Sends the request as a queue message and, when a reply is expected,
//! waits for the correlated answer. The security-header relay and any
//! identity assertion are applied to the request once, before the first
//! attempt.
//!
//! ## Attempt Flow
//!
//! ```text
//! expand destination ─► pre-send loop (at most MAX_OOPSES tries)
//!                         ├─ acquire pooled session
//!                         ├─ temporary reply queue (reply: temporary)
//!                         └─ send ──► sent = true
//!                                        │
//!          no reply expected ◄───────────┤
//!          └─ Success                    ▼
//!                               receive(correlation, response_timeout)
//!                                 ├─ message ─► response + properties
//!                                 └─ timeout ─► Terminal(no-response)
//! ```
//!
//! Once `sent` is true nothing is resent in this exchange: the backend may
//! already have acted on the message. Every failure after that point is
//! terminal, including on a failover set.

pub mod memory;
pub mod pool;
pub mod properties;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::pool::{MAX_OOPSES, PoolSettings, PooledSession, SessionPool};
use self::properties::{PropertyMode, propagate};
use self::provider::{NamingRetryPolicy, QueueError, QueueMessage, QueueSession};
use super::dispatch::{AttemptDispatcher, AttemptResult, run_failover};
use super::endpoint::EndpointSet;
use super::security_header::SecurityHeaderAction;
use super::{FailureReason, RoutingServices, prepare_security, publish};
use crate::context::{ExecutionContext, RoutingPhase};
use crate::failover::DEFAULT_RETRY_INTERVAL;
use crate::message::{ContentType, Message, QueueFacet};
use crate::policy::{NodeResult, Outcome, PolicyNode};

pub use self::memory::InMemoryBroker;
pub use self::provider::{QueueBody, QueueConnector};

pub const DESTINATION_VARIABLE: &str = "queueRouting.destination";
pub const LATENCY_VARIABLE: &str = "queueRouting.latency";
pub const FAILURE_REASON_VARIABLE: &str = "queueRouting.failureReason";
pub const BLACKLIST_VARIABLE: &str = "queueRouting.blacklist";

/// Default request ceiling: 5 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 5_242_880;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of the outbound queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundMessageType {
    #[default]
    Text,
    Bytes,
    /// Same kind as the inbound queue message; text for non-queue requests.
    CopyRequest,
}

impl OutboundMessageType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "bytes" | "binary" => Some(Self::Bytes),
            "copy_request" | "automatic" => Some(Self::CopyRequest),
            _ => None,
        }
    }
}

/// Where the backend sends its reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// One-way send.
    None,
    /// A temporary queue created for this exchange.
    #[default]
    Temporary,
    /// A shared destination; replies are told apart by correlation id.
    Explicit { destination: String },
}

/// Settings of one queue routing node.
#[derive(Debug, Clone)]
pub struct QueueRoutingConfig {
    /// Destination templates, expanded per attempt.
    pub destinations: Vec<String>,
    pub failover_strategy: Option<String>,
    pub retry_interval: Duration,
    pub message_type: OutboundMessageType,
    pub reply: ReplyMode,
    /// Match replies on the broker's message id instead of a generated
    /// correlation id.
    pub use_message_id_for_correlation: bool,
    pub response_timeout: Duration,
    pub max_message_bytes: u64,
    pub request_properties: PropertyMode,
    pub response_properties: PropertyMode,
    /// Pause between pre-send tries.
    pub retry_delay: Duration,
    pub naming_retry: NamingRetryPolicy,
    pub pool: PoolSettings,
    pub request_source: Option<String>,
    pub response_destination: Option<String>,
    pub security_header: SecurityHeaderAction,
    /// Attach a sender-vouches assertion for the authenticated caller.
    pub assert_identity: bool,
}

impl Default for QueueRoutingConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            failover_strategy: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            message_type: OutboundMessageType::Text,
            reply: ReplyMode::Temporary,
            use_message_id_for_correlation: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            request_properties: PropertyMode::PassAll,
            response_properties: PropertyMode::PassAll,
            retry_delay: DEFAULT_RETRY_DELAY,
            naming_retry: NamingRetryPolicy::TransientOnly,
            pool: PoolSettings::default(),
            request_source: None,
            response_destination: None,
            security_header: SecurityHeaderAction::Leave,
            assert_identity: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueRoutingError {
    #[error("queue routing node {node} has no destinations")]
    NoDestinations { node: String },
}

/// Routes the exchange over a message queue.
#[derive(Debug)]
pub struct QueueRoutingNode {
    name: String,
    config: QueueRoutingConfig,
    endpoints: EndpointSet<String>,
    sessions: SessionPool,
    services: RoutingServices,
}

impl QueueRoutingNode {
    /// # Errors
    ///
    /// [`QueueRoutingError::NoDestinations`] for an empty destination list.
    pub fn new(
        name: impl Into<String>,
        config: QueueRoutingConfig,
        connector: Arc<dyn QueueConnector>,
        services: RoutingServices,
    ) -> Result<Self, QueueRoutingError> {
        let name = name.into();
        let endpoints = EndpointSet::from_candidates(
            config.destinations.clone(),
            config.failover_strategy.as_deref(),
            config.retry_interval,
        )
        .ok_or_else(|| QueueRoutingError::NoDestinations { node: name.clone() })?;
        let sessions = SessionPool::new(connector, config.pool.clone());
        Ok(Self {
            name,
            config,
            endpoints,
            sessions,
            services,
        })
    }

    pub fn config(&self) -> &QueueRoutingConfig {
        &self.config
    }

    /// Route the exchange. Never fails; every problem maps to an outcome.
    #[tracing::instrument(skip_all, fields(node = %self.name, request_id = %ctx.request_id()))]
    pub async fn route(&self, ctx: &mut ExecutionContext) -> Outcome {
        let guard = ctx.routing_started();
        ctx.advance_routing_phase(RoutingPhase::Attempted);

        let outbound = match self.build_message(ctx) {
            Ok(message) => message,
            Err(outcome) => return outcome,
        };
        let exchange = QueueExchange {
            node: self,
            outbound,
            expects_reply: ctx.is_reply_expected() && self.config.reply != ReplyMode::None,
            correlation_id: format!("corr-{}", ctx.request_id()),
        };

        let outcome = run_failover(&self.endpoints, &exchange, ctx, BLACKLIST_VARIABLE).await;

        let latency = guard.finish();
        publish(ctx, LATENCY_VARIABLE, latency.as_millis() as i64);
        if outcome.is_continue() {
            ctx.advance_routing_phase(RoutingPhase::Routed);
            info!(latency_ms = latency.as_millis() as u64, "Request routed");
        } else {
            warn!(outcome = %outcome, latency_ms = latency.as_millis() as u64, "Routing failed");
        }
        outcome
    }

    /// Build the outbound message once per exchange, enforcing the size
    /// ceiling before any session is touched.
    fn build_message(&self, ctx: &mut ExecutionContext) -> Result<QueueMessage, Outcome> {
        let source = self.config.request_source.as_deref().unwrap_or("request");
        let max = self.config.max_message_bytes;
        prepare_security(
            ctx,
            source,
            &self.config.security_header,
            self.config.assert_identity,
            self.services.signer.as_deref(),
        )?;
        let (declared, body, inbound) = {
            let request = ctx.message_variable(source).map_err(|e| {
                warn!(variable = %source, error = %e, "Request source message unavailable");
                Outcome::ServerError
            })?;
            let declared = request.content_length();
            let body = match declared {
                Some(length) if length > max => None,
                _ if !request.is_initialized() => Some(Bytes::new()),
                _ => Some(request.body_bytes().map_err(|e| {
                    warn!(error = %e, "Request body unreadable for queue send");
                    Outcome::BadRequest
                })?),
            };
            (declared, body, request.facet::<QueueFacet>().cloned())
        };
        let body = match body {
            Some(body) if body.len() as u64 <= max => body,
            Some(body) => return Err(self.too_large(ctx, body.len() as u64)),
            None => return Err(self.too_large(ctx, declared.unwrap_or_default())),
        };

        let as_bytes = match self.config.message_type {
            OutboundMessageType::Text => false,
            OutboundMessageType::Bytes => true,
            OutboundMessageType::CopyRequest => inbound.as_ref().is_some_and(|f| f.bytes_message),
        };
        let source_properties = inbound.map(|f| f.properties).unwrap_or_default();

        let mut message = if as_bytes {
            QueueMessage::bytes(body)
        } else {
            match String::from_utf8(body.to_vec()) {
                Ok(text) => QueueMessage::text(text),
                Err(_) => {
                    warn!("Request body is not UTF-8; sending as bytes");
                    QueueMessage::bytes(body)
                }
            }
        };
        message.properties = propagate(
            &self.config.request_properties,
            &source_properties,
            ctx,
            self.services.expander.as_ref(),
        );
        Ok(message)
    }

    fn too_large(&self, ctx: &mut ExecutionContext, length: u64) -> Outcome {
        warn!(length, limit = self.config.max_message_bytes, "Request exceeds queue message ceiling");
        publish(ctx, FAILURE_REASON_VARIABLE, FailureReason::MessageTooLarge.as_str());
        Outcome::BadRequest
    }
}

#[async_trait]
impl PolicyNode for QueueRoutingNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        Ok(self.route(ctx).await)
    }

    fn release(&self) {
        self.sessions.close();
    }
}

// ============================================================================
// Per-attempt dispatch
// ============================================================================

struct QueueExchange<'a> {
    node: &'a QueueRoutingNode,
    outbound: QueueMessage,
    expects_reply: bool,
    correlation_id: String,
}

/// State after a successful send.
struct Sent {
    session: PooledSession,
    message_id: String,
    reply_to: Option<String>,
    temporary: bool,
}

impl QueueExchange<'_> {
    fn fail(&self, ctx: &mut ExecutionContext, destination: &str, reason: FailureReason, detail: &str) {
        publish(ctx, FAILURE_REASON_VARIABLE, reason.as_str());
        warn!(destination = %destination, reason = %reason, detail = %detail, "Queue routing attempt failed");
        self.node.services.listener.failed(destination, detail, ctx);
    }

    /// Acquire a session and send, retrying failures that happen before the
    /// send completes.
    async fn send(&self, destination: &str) -> Result<Sent, QueueError> {
        let node = self.node;
        let cfg = &node.config;
        let mut oops = 0u32;
        loop {
            match self.try_send(destination).await {
                Ok(sent) => {
                    node.sessions.record_success(destination);
                    return Ok(sent);
                }
                Err(e) => {
                    node.sessions.record_failure(destination);
                    oops += 1;
                    if !e.is_retryable(cfg.naming_retry) || oops >= MAX_OOPSES {
                        return Err(e);
                    }
                    warn!(
                        destination = %destination,
                        attempt = oops,
                        max_attempts = MAX_OOPSES,
                        delay_ms = cfg.retry_delay.as_millis() as u64,
                        error = %e,
                        "Queue send failed before completion, retrying"
                    );
                    tokio::time::sleep(cfg.retry_delay).await;
                }
            }
        }
    }

    async fn try_send(&self, destination: &str) -> Result<Sent, QueueError> {
        let mut pooled = self.node.sessions.acquire(destination).await?;
        let result = match pooled.session() {
            Some(session) => self.send_on(session, destination).await,
            None => Err(QueueError::Connection("session already released".to_string())),
        };
        match result {
            Ok((message_id, reply_to, temporary)) => Ok(Sent {
                session: pooled,
                message_id,
                reply_to,
                temporary,
            }),
            Err(e) => {
                if e.breaks_session() {
                    pooled.mark_broken();
                }
                Err(e)
            }
        }
    }

    /// Set up the reply destination and send. Returns the message id, the
    /// reply destination and whether it is temporary.
    async fn send_on(
        &self,
        session: &mut dyn QueueSession,
        destination: &str,
    ) -> Result<(String, Option<String>, bool), QueueError> {
        let cfg = &self.node.config;
        let (reply_to, temporary) = match (&cfg.reply, self.expects_reply) {
            (_, false) | (ReplyMode::None, _) => (None, false),
            (ReplyMode::Temporary, true) => (Some(session.create_temporary_queue().await?), true),
            (ReplyMode::Explicit { destination: reply }, true) => (Some(reply.clone()), false),
        };
        let mut message = self.outbound.clone();
        message.reply_to = reply_to.clone();
        if !cfg.use_message_id_for_correlation {
            message.correlation_id = Some(self.correlation_id.clone());
        }
        match session.send(destination, message).await {
            Ok(message_id) => Ok((message_id, reply_to, temporary)),
            Err(e) => {
                if temporary
                    && let Some(tmp) = &reply_to
                    && let Err(cleanup) = session.delete_temporary_queue(tmp).await
                {
                    warn!(queue = %tmp, error = %cleanup, "Temporary reply queue not deleted after failed send");
                }
                Err(e)
            }
        }
    }

    async fn await_reply(&self, sent: &mut Sent) -> Result<Option<QueueMessage>, QueueError> {
        let Some(reply_to) = sent.reply_to.clone() else {
            return Ok(None);
        };
        let filter = match (&self.node.config.reply, self.node.config.use_message_id_for_correlation) {
            (ReplyMode::Temporary, _) => None,
            (_, true) => Some(sent.message_id.clone()),
            (_, false) => Some(self.correlation_id.clone()),
        };
        let Some(session) = sent.session.session() else {
            return Err(QueueError::Receive {
                destination: reply_to,
                detail: "session already released".to_string(),
            });
        };
        let received = session
            .receive(&reply_to, filter.as_deref(), self.node.config.response_timeout)
            .await;
        if sent.temporary
            && let Err(e) = session.delete_temporary_queue(&reply_to).await
        {
            debug!(queue = %reply_to, error = %e, "Temporary reply queue not deleted");
        }
        if let Err(e) = &received
            && e.breaks_session()
        {
            sent.session.mark_broken();
        }
        received
    }

    fn deliver(&self, ctx: &mut ExecutionContext, reply: QueueMessage) -> Result<(), crate::context::VariableError> {
        let node = self.node;
        let properties = propagate(
            &node.config.response_properties,
            &reply.properties,
            ctx,
            node.services.expander.as_ref(),
        );
        let facet = QueueFacet {
            bytes_message: reply.body.is_bytes(),
            message_id: reply.message_id.clone(),
            correlation_id: reply.correlation_id.clone(),
            properties,
        };
        let content_type = match &reply.body {
            QueueBody::Bytes(_) => ContentType::octet_stream(),
            QueueBody::Text(text) if text.trim_start().starts_with('<') => ContentType::xml(),
            QueueBody::Text(_) => ContentType::text(),
        };

        let fill = |message: &mut Message| {
            message.initialize(content_type, reply.body.into_bytes());
            message.replace(facet);
        };
        match node.config.response_destination.as_deref() {
            Some(var) if !var.eq_ignore_ascii_case("response") => {
                let mut message = Message::new();
                fill(&mut message);
                ctx.set_message_variable(var, message)
            }
            _ => {
                fill(ctx.response_mut());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AttemptDispatcher<String> for QueueExchange<'_> {
    async fn attempt(&self, candidate: &String, ctx: &mut ExecutionContext) -> AttemptResult {
        let destination = match ctx.expand(self.node.services.expander.as_ref(), candidate) {
            Ok(d) if !d.trim().is_empty() => d.trim().to_string(),
            Ok(_) => {
                self.fail(ctx, candidate, FailureReason::Undefined, "destination expanded to nothing");
                return AttemptResult::Retryable(Outcome::Failed);
            }
            Err(e) => {
                self.fail(ctx, candidate, FailureReason::Undefined, &e.to_string());
                return AttemptResult::Retryable(Outcome::Failed);
            }
        };
        publish(ctx, DESTINATION_VARIABLE, destination.clone());

        debug!(destination = %destination, "Sending queue message");
        let mut sent = match self.send(&destination).await {
            Ok(sent) => sent,
            Err(e) => {
                self.fail(ctx, &destination, FailureReason::Undefined, &e.to_string());
                return AttemptResult::Retryable(Outcome::Failed);
            }
        };
        debug!(destination = %destination, message_id = %sent.message_id, "Queue message sent");

        if !self.expects_reply {
            return AttemptResult::Success;
        }

        match self.await_reply(&mut sent).await {
            Ok(Some(reply)) => {
                if let Err(e) = self.deliver(ctx, reply) {
                    error!(error = %e, "Queue reply could not be stored");
                    return AttemptResult::Terminal(Outcome::ServerError);
                }
                AttemptResult::Success
            }
            Ok(None) => {
                self.fail(ctx, &destination, FailureReason::NoResponse, "no reply within response timeout");
                AttemptResult::Terminal(Outcome::Failed)
            }
            Err(e) => {
                self.fail(ctx, &destination, FailureReason::Undefined, &e.to_string());
                AttemptResult::Terminal(Outcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(broker: &InMemoryBroker, config: QueueRoutingConfig) -> QueueRoutingNode {
        QueueRoutingNode::new("q", config, Arc::new(broker.clone()), RoutingServices::default()).unwrap()
    }

    #[test]
    fn message_type_parsing() {
        assert_eq!(OutboundMessageType::parse("Bytes"), Some(OutboundMessageType::Bytes));
        assert_eq!(
            OutboundMessageType::parse("copy_request"),
            Some(OutboundMessageType::CopyRequest)
        );
        assert_eq!(OutboundMessageType::parse("stream"), None);
    }

    #[test]
    fn empty_destination_list_is_rejected() {
        let result = QueueRoutingNode::new(
            "q",
            QueueRoutingConfig::default(),
            Arc::new(InMemoryBroker::new()),
            RoutingServices::default(),
        );
        assert!(matches!(result, Err(QueueRoutingError::NoDestinations { .. })));
    }

    #[tokio::test]
    async fn one_way_send_succeeds_without_reply() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let node = node(
            &broker,
            QueueRoutingConfig {
                destinations: vec!["orders".into()],
                reply: ReplyMode::None,
                ..QueueRoutingConfig::default()
            },
        );
        let mut ctx = ExecutionContext::new(Message::with_body(ContentType::xml(), "<o/>"), Message::new());

        assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
        let sent = broker.take("orders", None).unwrap();
        assert_eq!(sent.body, QueueBody::Text("<o/>".into()));
        assert_eq!(
            sent.correlation_id.as_deref(),
            Some(format!("corr-{}", ctx.request_id()).as_str())
        );
        assert_eq!(ctx.variable(DESTINATION_VARIABLE).unwrap().to_string(), "orders");
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_send() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let node = node(
            &broker,
            QueueRoutingConfig {
                destinations: vec!["orders".into()],
                max_message_bytes: 4,
                ..QueueRoutingConfig::default()
            },
        );
        let mut ctx = ExecutionContext::new(Message::with_body(ContentType::text(), "too long"), Message::new());

        assert_eq!(node.route(&mut ctx).await, Outcome::BadRequest);
        assert_eq!(
            ctx.variable(FAILURE_REASON_VARIABLE).unwrap().to_string(),
            "message-too-large"
        );
        assert_eq!(broker.depth("orders"), 0);
    }

    #[tokio::test]
    async fn destination_template_is_expanded() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders.eu");
        let node = node(
            &broker,
            QueueRoutingConfig {
                destinations: vec!["orders.${region}".into()],
                reply: ReplyMode::None,
                ..QueueRoutingConfig::default()
            },
        );
        let mut ctx = ExecutionContext::new(Message::with_body(ContentType::text(), "x"), Message::new());
        ctx.set_variable("region", "eu").unwrap();

        assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
        assert_eq!(broker.depth("orders.eu"), 1);
    }

    #[tokio::test]
    async fn permanent_naming_error_is_not_retried() {
        let broker = InMemoryBroker::new();
        let node = node(
            &broker,
            QueueRoutingConfig {
                destinations: vec!["missing".into()],
                reply: ReplyMode::None,
                retry_delay: Duration::from_millis(1),
                ..QueueRoutingConfig::default()
            },
        );
        let mut ctx = ExecutionContext::new(Message::with_body(ContentType::text(), "x"), Message::new());

        assert_eq!(node.route(&mut ctx).await, Outcome::Failed);
        assert_eq!(ctx.variable(FAILURE_REASON_VARIABLE).unwrap().to_string(), "undefined");
    }
}
