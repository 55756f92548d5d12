//! HTTP routing node.
//!
//! Forwards the exchange's request message to an HTTP backend and writes the
//! answer into the response message, or into a message variable when
//! `response_destination` is set.
//!
//! ## Exchange Flow
//!
//! ```text
//! prepare (once per exchange)
//!   ├─ security header relay, identity assertion
//!   ├─ header rules, credentials, User-Agent, IV_USER chaining
//!   └─ body mode: buffered | streamed | collected (HTTP/1.0)
//!        │
//!        ▼
//! run_failover ──► attempt(candidate)
//!                    ├─ expand URL template, publish URL parts
//!                    ├─ acquire permits, send (connect retries)
//!                    ├─ non-200 + listener.reroute ─► resend once
//!                    ├─ status >= 500 ─► Falsified (SOAP fault passthrough)
//!                    └─ read body (limit) ─► destination message
//! ```
//!
//! # Variables
//!
//! | Name | Value |
//! |------|-------|
//! | `httpRouting.url` and `.host`, `.protocol`, `.port`, `.path`, `.query`, `.fragment` | last attempted URL |
//! | `httpRouting.latency` | milliseconds for the whole dispatch |
//! | `httpRouting.reasonCode` | last HTTP status |
//! | `httpRouting.failureReason` | last transport failure reason |
//! | `httpRouting.blacklist` | candidates that failed in this exchange |

pub mod body;
pub mod client;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use http::{Method, StatusCode, Version};
use parking_lot::Mutex;
use reqwest::Response;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use self::body::{BodyReadError, OutboundBody, choose_body_mode, gzip, read_body_limited};
use self::client::{CallPermit, HttpClientSettings, HttpTransport, HttpVersionPref, SendFailure, TransportError};
use super::dispatch::{AttemptDispatcher, AttemptResult, run_failover};
use super::endpoint::{EndpointSet, UrlParts, check_static_url};
use super::identity::chain_credentials;
use super::rules::{Direction, ForwardingMode};
use super::security_header::SecurityHeaderAction;
use super::{FailureReason, RoutingServices, prepare_security, publish};
use crate::context::{ExecutionContext, RoutingPhase};
use crate::failover::DEFAULT_RETRY_INTERVAL;
use crate::message::{
    BodyStream, ContentType, HttpRequestFacet, HttpResponseFacet, Message, MessageError,
    SoapDocument, limit_stream,
};
use crate::policy::{NodeResult, Outcome, PolicyNode};
use crate::stash::Stash;

pub const URL_VARIABLE: &str = "httpRouting.url";
pub const LATENCY_VARIABLE: &str = "httpRouting.latency";
pub const REASON_CODE_VARIABLE: &str = "httpRouting.reasonCode";
pub const FAILURE_REASON_VARIABLE: &str = "httpRouting.failureReason";
pub const BLACKLIST_VARIABLE: &str = "httpRouting.blacklist";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Settings of one HTTP routing node.
#[derive(Debug, Clone)]
pub struct HttpRoutingConfig {
    /// URL templates. One entry without a strategy routes to a single
    /// endpoint; otherwise the strategy picks among them.
    pub urls: Vec<String>,
    pub failover_strategy: Option<String>,
    pub retry_interval: Duration,
    pub client: HttpClientSettings,
    /// Connect retries on the same candidate.
    pub retries: u32,
    /// Template for the response body ceiling in bytes.
    pub max_response_bytes: Option<String>,
    /// Message variable to send instead of the default request.
    pub request_source: Option<String>,
    /// Message variable to receive the response instead of the default
    /// response.
    pub response_destination: Option<String>,
    pub request_headers: ForwardingMode,
    pub response_headers: ForwardingMode,
    /// Applied to form-encoded request bodies.
    pub request_params: ForwardingMode,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Forward the inbound `Authorization` header when no login is set.
    pub pass_through_authorization: bool,
    pub user_agent: Option<String>,
    pub gzip_request: bool,
    pub stream_response: bool,
    pub pass_through_soap_faults: bool,
    pub security_header: SecurityHeaderAction,
    pub assert_identity: bool,
    pub chain_credentials: bool,
}

impl Default for HttpRoutingConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            failover_strategy: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            client: HttpClientSettings::default(),
            retries: 2,
            max_response_bytes: None,
            request_source: None,
            response_destination: None,
            request_headers: ForwardingMode::PassAll,
            response_headers: ForwardingMode::PassAll,
            request_params: ForwardingMode::PassAll,
            login: None,
            password: None,
            pass_through_authorization: false,
            user_agent: None,
            gzip_request: false,
            stream_response: false,
            pass_through_soap_faults: false,
            security_header: SecurityHeaderAction::Leave,
            assert_identity: false,
            chain_credentials: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpRoutingError {
    #[error("HTTP routing node {node} has no URLs")]
    NoEndpoints { node: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Routes the exchange to an HTTP backend.
#[derive(Debug)]
pub struct HttpRoutingNode {
    name: String,
    config: HttpRoutingConfig,
    endpoints: EndpointSet<String>,
    transport: HttpTransport,
    services: RoutingServices,
}

impl HttpRoutingNode {
    /// Invalid static URLs and unknown strategy names are logged and
    /// tolerated; they fail per attempt instead.
    ///
    /// # Errors
    ///
    /// [`HttpRoutingError::NoEndpoints`] for an empty URL list, and
    /// [`HttpRoutingError::Transport`] when the client cannot be built.
    pub fn new(
        name: impl Into<String>,
        config: HttpRoutingConfig,
        services: RoutingServices,
    ) -> Result<Self, HttpRoutingError> {
        let name = name.into();
        for url in &config.urls {
            if let Some(problem) = check_static_url(url) {
                warn!(node = %name, problem = %problem, "Routing URL will fail at dispatch");
            }
        }
        let endpoints = EndpointSet::from_candidates(
            config.urls.clone(),
            config.failover_strategy.as_deref(),
            config.retry_interval,
        )
        .ok_or_else(|| HttpRoutingError::NoEndpoints { node: name.clone() })?;
        let transport = HttpTransport::new(config.client.clone())?;

        debug!(node = %name, endpoints = ?endpoints, "HTTP routing node created");
        Ok(Self {
            name,
            config,
            endpoints,
            transport,
            services,
        })
    }

    pub fn config(&self) -> &HttpRoutingConfig {
        &self.config
    }

    fn source_variable(&self) -> &str {
        self.config.request_source.as_deref().unwrap_or("request")
    }

    /// Route the exchange. Never fails; every problem maps to an outcome.
    #[tracing::instrument(skip_all, fields(node = %self.name, request_id = %ctx.request_id()))]
    pub async fn route(&self, ctx: &mut ExecutionContext) -> Outcome {
        let guard = ctx.routing_started();
        ctx.advance_routing_phase(RoutingPhase::Attempted);

        let prepared = match self.prepare(ctx).await {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        let exchange = Exchange {
            node: self,
            prepared,
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

    // ------------------------------------------------------------------------
    // Per-exchange preparation
    // ------------------------------------------------------------------------

    async fn prepare(&self, ctx: &mut ExecutionContext) -> Result<PreparedRequest, Outcome> {
        let cfg = &self.config;
        let expander = self.services.expander.as_ref();
        let source = self.source_variable().to_string();
        let from_default_request = source.eq_ignore_ascii_case("request");

        let basic = match &cfg.login {
            Some(login) => {
                let user = ctx.expand(expander, login);
                let pass = cfg.password.as_deref().map(|p| ctx.expand(expander, p)).transpose();
                match (user, pass) {
                    (Ok(user), Ok(pass)) => Some((user, pass)),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "Routing credentials not expanded");
                        return Err(Outcome::ServerError);
                    }
                }
            }
            None => None,
        };
        let subject = ctx.last_authentication().cloned();

        let (method, inbound_headers) = {
            let message = ctx.message_variable(&source).map_err(|e| {
                warn!(variable = %source, error = %e, "Request source message unavailable");
                Outcome::ServerError
            })?;
            let facet = message.facet::<HttpRequestFacet>();
            let method = match facet {
                Some(f) if from_default_request => outbound_method(&f.method),
                _ => Method::POST,
            };
            (method, facet.map(|f| f.headers.clone()).unwrap_or_default())
        };

        let mut headers = HeaderMap::new();
        self.services.rule_enforcer.apply_header_rules(
            Direction::Request,
            &cfg.request_headers,
            &inbound_headers,
            &mut headers,
            ctx,
            expander,
        );
        headers.remove(AUTHORIZATION);
        headers.remove(CONTENT_TYPE);
        headers.remove(CONTENT_ENCODING);
        if basic.is_none()
            && cfg.pass_through_authorization
            && let Some(value) = inbound_headers.get(AUTHORIZATION)
        {
            headers.insert(AUTHORIZATION, value.clone());
        }
        match &cfg.user_agent {
            Some(template) => match ctx.expand(expander, template).map(|ua| HeaderValue::from_str(&ua)) {
                Ok(Ok(value)) => {
                    headers.insert(USER_AGENT, value);
                }
                _ => warn!("Configured User-Agent not usable; omitted"),
            },
            None => {
                if !headers.contains_key(USER_AGENT)
                    && let Some(value) = inbound_headers.get(USER_AGENT)
                {
                    headers.insert(USER_AGENT, value.clone());
                }
            }
        }
        if cfg.chain_credentials
            && let Some(subject) = &subject
        {
            chain_credentials(&mut headers, &subject.user);
        }

        prepare_security(
            ctx,
            &source,
            &cfg.security_header,
            cfg.assert_identity,
            self.services.signer.as_deref(),
        )?;

        let sends_body = matches!(method, Method::POST | Method::PUT);
        let content_type = ctx.message_variable(&source).ok().and_then(|m| m.content_type().cloned());

        let mut body = if !sends_body {
            OutboundBody::Empty
        } else if let Some(form) = self.rewrite_form(ctx, &source, content_type.as_ref()) {
            OutboundBody::Buffered(form)
        } else {
            let message = ctx.message_variable_mut(&source).map_err(|_| Outcome::ServerError)?;
            choose_body_mode(message, cfg.client.version).await.map_err(|e| match e {
                MessageError::SizeExceeded { limit, actual } => {
                    warn!(limit, actual, "Request body over its ceiling");
                    Outcome::SizeExceeded
                }
                other => {
                    warn!(error = %other, "Request body unreadable");
                    Outcome::BadRequest
                }
            })?
        };

        if cfg.gzip_request
            && let OutboundBody::Buffered(bytes) = &body
            && !bytes.is_empty()
        {
            match gzip(bytes) {
                Ok(packed) => {
                    body = OutboundBody::Buffered(packed);
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                }
                Err(e) => warn!(error = %e, "Request compression failed; sending uncompressed"),
            }
        }

        if sends_body
            && let Some(ct) = &content_type
            && let Ok(value) = HeaderValue::from_str(ct.as_str())
        {
            headers.insert(CONTENT_TYPE, value);
        }

        Ok(PreparedRequest {
            method,
            headers,
            basic,
            body: Mutex::new(body),
        })
    }

    /// Re-encode a form body through the parameter rules. `None` when the
    /// body is not a form or every parameter passes.
    fn rewrite_form(&self, ctx: &ExecutionContext, source: &str, content_type: Option<&ContentType>) -> Option<Bytes> {
        if self.config.request_params == ForwardingMode::PassAll
            || content_type.map(ContentType::essence) != Some(FORM_CONTENT_TYPE)
        {
            return None;
        }
        let message = ctx.message_variable(source).ok()?;
        let raw = message.body_bytes().ok()?;
        let params: Vec<(String, String)> = url::form_urlencoded::parse(&raw).into_owned().collect();
        let kept = self.services.rule_enforcer.apply_param_rules(
            &self.config.request_params,
            &params,
            ctx,
            self.services.expander.as_ref(),
        );
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        debug!(before = params.len(), "Form parameters filtered");
        Some(Bytes::from(encoded))
    }

    fn response_limit(&self, ctx: &ExecutionContext) -> Option<u64> {
        let template = self.config.max_response_bytes.as_deref()?;
        match ctx
            .expand(self.services.expander.as_ref(), template)
            .map(|v| v.trim().parse::<u64>())
        {
            Ok(Ok(limit)) => Some(limit),
            _ => {
                warn!(template = %template, "Response size limit not a byte count; unlimited");
                None
            }
        }
    }
}

#[async_trait]
impl PolicyNode for HttpRoutingNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        Ok(self.route(ctx).await)
    }
}

/// GET, POST, PUT and DELETE are forwarded as is; anything else is sent as
/// POST.
fn outbound_method(inbound: &Method) -> Method {
    match *inbound {
        Method::GET | Method::POST | Method::PUT | Method::DELETE => inbound.clone(),
        _ => Method::POST,
    }
}

// ============================================================================
// Per-attempt dispatch
// ============================================================================

struct PreparedRequest {
    method: Method,
    headers: HeaderMap,
    basic: Option<(String, Option<String>)>,
    body: Mutex<OutboundBody>,
}

/// Response body on its way into the destination message.
enum Delivered {
    Stashed(Box<dyn Stash>),
    Streaming(BodyStream, Option<u64>),
}

/// One exchange's view of the node: the shared node plus the request
/// prepared for this exchange.
struct Exchange<'a> {
    node: &'a HttpRoutingNode,
    prepared: PreparedRequest,
}

impl Exchange<'_> {
    fn replayable(&self) -> bool {
        self.prepared.body.lock().is_replayable()
    }

    fn resolve_url(&self, candidate: &str, ctx: &ExecutionContext) -> Result<Url, String> {
        let expanded = ctx
            .expand(self.node.services.expander.as_ref(), candidate)
            .map_err(|e| e.to_string())?;
        let url = Url::parse(expanded.trim()).map_err(|e| format!("{expanded}: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        Ok(url)
    }

    fn record_failure(&self, ctx: &mut ExecutionContext, url: &str, reason: FailureReason, detail: &str) {
        publish(ctx, FAILURE_REASON_VARIABLE, reason.as_str());
        warn!(url = %url, reason = %reason, detail = %detail, "Routing attempt failed");
        self.node.services.listener.failed(url, detail, ctx);
    }

    /// A failure is retryable on another candidate unless the request body
    /// was a one-shot stream that has already been sent.
    fn failed(&self, outcome: Outcome) -> AttemptResult {
        if self.replayable() {
            AttemptResult::Retryable(outcome)
        } else {
            AttemptResult::Terminal(outcome)
        }
    }

    async fn send(&self, url: &Url) -> Result<(Response, CallPermit), SendFailure> {
        let transport = &self.node.transport;
        let permit = transport.acquire(url.host_str().unwrap_or_default()).await?;
        let retries = if self.replayable() {
            self.node.config.retries
        } else {
            0
        };
        let http10 = transport.settings().version == HttpVersionPref::Http10;
        let prepared = &self.prepared;

        let response = transport
            .send_with_retry(retries, || {
                let body = prepared.body.lock().for_send()?;
                let mut request = transport
                    .client()
                    .request(prepared.method.clone(), url.clone())
                    .headers(prepared.headers.clone())
                    .body(body);
                if http10 {
                    request = request.version(Version::HTTP_10);
                }
                if let Some((user, pass)) = &prepared.basic {
                    request = request.basic_auth(user, pass.as_ref());
                }
                Some(request)
            })
            .await?;
        Ok((response, permit))
    }

    async fn accept(
        &self,
        response: Response,
        permit: CallPermit,
        url: &Url,
        ctx: &mut ExecutionContext,
    ) -> AttemptResult {
        let cfg = &self.node.config;
        let services = &self.node.services;
        let status = response.status();

        if status.as_u16() >= 500 && !cfg.pass_through_soap_faults {
            warn!(url = %url, status = status.as_u16(), "Backend returned a server error");
            return self.failed(Outcome::Falsified);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ContentType::parse);
        if status == StatusCode::OK && content_type.is_none() && response.content_length() != Some(0) {
            warn!(url = %url, "Backend response has no Content-Type");
            return self.failed(Outcome::Falsified);
        }
        let content_type = content_type.unwrap_or_else(ContentType::octet_stream);

        let mut headers = HeaderMap::new();
        services.rule_enforcer.apply_header_rules(
            Direction::Response,
            &cfg.response_headers,
            response.headers(),
            &mut headers,
            ctx,
            services.expander.as_ref(),
        );
        let facet = HttpResponseFacet { status, headers };
        let limit = self.node.response_limit(ctx);

        let delivered = if cfg.stream_response && status.as_u16() < 500 {
            if let (Some(limit), Some(length)) = (limit, response.content_length())
                && length > limit
            {
                warn!(content_length = length, limit, "Streamed response exceeds size limit");
                return AttemptResult::Terminal(Outcome::SizeExceeded);
            }
            let length = response.content_length();
            let stream: BodyStream = Box::pin(response.bytes_stream().map(move |chunk| {
                let _held = &permit;
                chunk.map_err(io::Error::other)
            }));
            let stream = match limit {
                Some(limit) => limit_stream(stream, limit),
                None => stream,
            };
            Delivered::Streaming(stream, length)
        } else {
            let mut stash = services.stash_factory.create(limit);
            match read_body_limited(response, stash.as_mut(), limit).await {
                Ok(()) => {}
                Err(BodyReadError::TooLarge { limit }) => {
                    warn!(url = %url, limit, "Response body over its ceiling");
                    return AttemptResult::Terminal(Outcome::SizeExceeded);
                }
                Err(BodyReadError::Transport(e)) => {
                    let failure = client::classify_error(&e);
                    self.record_failure(ctx, url.as_str(), failure.reason, &failure.detail);
                    return self.failed(Outcome::Failed);
                }
                Err(BodyReadError::Store(e)) => {
                    error!(error = %e, "Response body could not be stored");
                    return AttemptResult::Terminal(Outcome::ServerError);
                }
            }
            drop(permit);
            if status.as_u16() >= 500 {
                if !is_soap_fault(stash.as_ref()) {
                    warn!(url = %url, status = status.as_u16(), "Backend server error is not a SOAP fault");
                    return self.failed(Outcome::Falsified);
                }
                debug!(url = %url, "Passing SOAP fault through");
            }
            Delivered::Stashed(stash)
        };

        if let Err(e) = self.deliver(ctx, content_type, delivered, facet) {
            warn!(error = %e, "Response destination not writable");
            return AttemptResult::Terminal(Outcome::ServerError);
        }
        AttemptResult::Success
    }

    fn deliver(
        &self,
        ctx: &mut ExecutionContext,
        content_type: ContentType,
        delivered: Delivered,
        facet: HttpResponseFacet,
    ) -> Result<(), crate::context::VariableError> {
        fn fill(message: &mut Message, content_type: ContentType, delivered: Delivered, facet: HttpResponseFacet) {
            match delivered {
                Delivered::Stashed(stash) => message.initialize_stashed(content_type, stash),
                Delivered::Streaming(stream, length) => {
                    message.initialize_streaming(content_type, stream, length);
                }
            }
            message.replace(facet);
        }

        match self.node.config.response_destination.as_deref() {
            Some(var) if !var.eq_ignore_ascii_case("response") => {
                let mut message = Message::new();
                fill(&mut message, content_type, delivered, facet);
                ctx.set_message_variable(var, message)
            }
            _ => {
                fill(ctx.response_mut(), content_type, delivered, facet);
                Ok(())
            }
        }
    }
}

fn is_soap_fault(stash: &dyn Stash) -> bool {
    stash
        .read_all()
        .ok()
        .and_then(|bytes| SoapDocument::parse(&bytes).ok())
        .is_some_and(|doc| doc.is_fault())
}

#[async_trait]
impl AttemptDispatcher<String> for Exchange<'_> {
    async fn attempt(&self, candidate: &String, ctx: &mut ExecutionContext) -> AttemptResult {
        let listener = &self.node.services.listener;

        let url = match self.resolve_url(candidate, ctx) {
            Ok(url) => url,
            Err(detail) => {
                self.record_failure(ctx, candidate, FailureReason::BadUrl, &detail);
                return AttemptResult::Retryable(Outcome::Failed);
            }
        };
        let parts = UrlParts::of(&url);
        publish(ctx, URL_VARIABLE, parts.url.clone());
        publish(ctx, "httpRouting.url.host", parts.host);
        publish(ctx, "httpRouting.url.protocol", parts.protocol);
        publish(ctx, "httpRouting.url.port", i64::from(parts.port));
        publish(ctx, "httpRouting.url.path", parts.path);
        publish(ctx, "httpRouting.url.query", parts.query);
        publish(ctx, "httpRouting.url.fragment", parts.fragment);

        let mut rerouted = false;
        loop {
            debug!(url = %url, method = %self.prepared.method, "Sending request to backend");
            let (response, permit) = match self.send(&url).await {
                Ok(sent) => sent,
                Err(failure) => {
                    self.record_failure(ctx, url.as_str(), failure.reason, &failure.detail);
                    return self.failed(Outcome::Failed);
                }
            };

            let status = response.status();
            publish(ctx, REASON_CODE_VARIABLE, i64::from(status.as_u16()));
            listener.routed(url.as_str(), status, response.headers(), ctx);

            if status != StatusCode::OK
                && !rerouted
                && self.replayable()
                && listener.reroute(url.as_str(), status, response.headers(), ctx)
            {
                debug!(url = %url, status = status.as_u16(), "Listener requested reroute");
                rerouted = true;
                drop(permit);
                continue;
            }
            return self.accept(response, permit, &url, ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_outside_the_forwarded_set_become_post() {
        assert_eq!(outbound_method(&Method::GET), Method::GET);
        assert_eq!(outbound_method(&Method::DELETE), Method::DELETE);
        assert_eq!(outbound_method(&Method::PATCH), Method::POST);
        assert_eq!(outbound_method(&Method::OPTIONS), Method::POST);
    }

    #[test]
    fn empty_url_list_is_rejected() {
        let result = HttpRoutingNode::new("r", HttpRoutingConfig::default(), RoutingServices::default());
        assert!(matches!(result, Err(HttpRoutingError::NoEndpoints { .. })));
    }

    #[test]
    fn invalid_static_url_is_tolerated_at_construction() {
        let config = HttpRoutingConfig {
            urls: vec!["not a url".into()],
            ..HttpRoutingConfig::default()
        };
        assert!(HttpRoutingNode::new("r", config, RoutingServices::default()).is_ok());
    }

    #[tokio::test]
    async fn invalid_url_fails_with_bad_url_reason() {
        let config = HttpRoutingConfig {
            urls: vec!["not a url".into()],
            ..HttpRoutingConfig::default()
        };
        let node = HttpRoutingNode::new("r", config, RoutingServices::default()).unwrap();
        let mut ctx = ExecutionContext::new(Message::new(), Message::new());

        assert_eq!(node.route(&mut ctx).await, Outcome::Failed);
        assert_eq!(
            ctx.variable(FAILURE_REASON_VARIABLE).unwrap().to_string(),
            "bad-url"
        );
        assert_eq!(ctx.routing_stats().in_flight(), 0);
    }

    #[test]
    fn soap_fault_detection() {
        let fault = "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\
                     <s:Body><s:Fault><faultcode>s:Server</faultcode></s:Fault></s:Body></s:Envelope>";
        let stash = crate::stash::MemoryStash::from_bytes(Bytes::from_static(fault.as_bytes()));
        assert!(is_soap_fault(&stash));
        let plain = crate::stash::MemoryStash::from_bytes(Bytes::from_static(b"oops"));
        assert!(!is_soap_fault(&plain));
    }
}
