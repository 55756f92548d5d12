//! Inbound HTTP service.
//!
//! ```text
//! request ─► /health? ─► 200
//!    │
//!    ▼
//! service_index_for(path) ── none ──► 404 (NoService)
//!    │
//!    ▼
//! body ─► stash (buffered, request ceiling)   or   limited stream (stream_requests)
//!    │
//!    ▼
//! attach HttpRequestFacet ─► PolicyTree::run
//!    │
//!    ├── Continue ─► render response message (status/headers from HttpResponseFacet)
//!    └── stop     ─► synthesized failure: SOAP fault for SOAP callers, JSON otherwise
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaygate_core::config::{Config, ConfigError, RelaygateDefaults};
use relaygate_core::context::ExecutionContext;
use relaygate_core::error::GatewayError;
use relaygate_core::message::{
    BodyStream, ContentType, HttpRequestFacet, HttpResponseFacet, Message, MessageError,
    SoapDocument, SoapVersion, limit_stream,
};
use relaygate_core::policy::PolicyTree;
use relaygate_core::policy::build::{PolicyBuilder, broker_for, services_for};
use relaygate_core::stash::{StashError, StashFactory};

/// Response header carrying the exchange id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id reported for failures that happen before an exchange exists.
const NO_EXCHANGE: &str = "none";

/// Headers describing a single hop; never copied onto the caller's response.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "upgrade",
    "content-length",
];

/// Policy trees of every configured service plus what the inbound side
/// needs to feed them.
pub struct Gateway {
    config: Config,
    trees: Vec<PolicyTree>,
    stash_factory: Arc<dyn StashFactory>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build every service's policy tree. Queue routes use an in-memory
    /// broker holding the configured queues.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a policy tree cannot be built.
    pub fn build(
        config: Config,
        defaults: RelaygateDefaults,
        shutdown: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let services = services_for(&config);
        let stash_factory = services.stash_factory.clone();
        let broker = broker_for(&config);
        let trees = PolicyBuilder::new(&config, services, Arc::new(broker))
            .with_defaults(defaults)
            .build()?;
        info!(services = trees.len(), "Policy trees built");
        Ok(Self {
            config,
            trees,
            stash_factory,
            shutdown,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health))
            .fallback(handle)
            .with_state(self)
    }

    /// Release every policy tree. Idempotent.
    pub fn release(&self) {
        for tree in &self.trees {
            tree.release();
        }
    }

    /// Release every policy tree on the blocking pool, giving up after
    /// `budget`. Returns whether the release finished in time.
    pub async fn release_within(self: Arc<Self>, budget: Duration) -> bool {
        let releasing = tokio::task::spawn_blocking(move || self.release());
        match tokio::time::timeout(budget, releasing).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Policy tree release did not complete");
                false
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "Policy tree release exceeded shutdown budget");
                false
            }
        }
    }

    async fn exchange(&self, request: Request) -> Response {
        let path = request.uri().path().to_string();
        if self.shutdown.is_cancelled() {
            return failure(&GatewayError::ShuttingDown, NO_EXCHANGE, None);
        }
        let Some(index) = self.config.service_index_for(&path) else {
            debug!(path = %path, "No service mounted");
            return failure(&GatewayError::NoService { path }, NO_EXCHANGE, None);
        };
        let service = &self.config.services[index];
        let Some(tree) = self.trees.get(index) else {
            error!(service = %service.name, "Service has no policy tree");
            let err = GatewayError::Internal {
                detail: format!("no policy tree for service {}", service.name),
            };
            return failure(&err, NO_EXCHANGE, None);
        };

        let (parts, body) = request.into_parts();
        let limit = self.config.limits.max_request_bytes;
        let mut message = match self
            .read_request(&parts.headers, body, limit, service.stream_requests)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!(service = %service.name, error = %e, "Inbound request rejected");
                return failure(&e, NO_EXCHANGE, None);
            }
        };
        let mut facet = HttpRequestFacet::new(parts.method, parts.uri, parts.headers);
        facet.remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        if let Err(e) = message.attach(facet) {
            let err = GatewayError::from(e);
            return failure(&err, NO_EXCHANGE, None);
        }

        let mut ctx = ExecutionContext::new(message, Message::new());
        let request_id = ctx.request_id().to_string();
        let outcome = tree.run(&mut ctx).await;

        let mut response = if outcome.is_continue() {
            match render(ctx.response_mut()) {
                Ok(response) => response,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Response could not be rendered");
                    failure(&e, &request_id, soap_version(ctx.request_mut()))
                }
            }
        } else {
            let err = GatewayError::policy(tree.service(), outcome);
            if err.http_status().is_server_error() {
                warn!(request_id = %request_id, service = %tree.service(), outcome = %outcome, "Exchange failed");
            } else {
                debug!(request_id = %request_id, service = %tree.service(), outcome = %outcome, "Exchange stopped");
            }
            failure(&err, &request_id, soap_version(ctx.request_mut()))
        };
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }

    /// Turn the inbound body into the request message.
    async fn read_request(
        &self,
        headers: &HeaderMap,
        body: Body,
        limit: u64,
        stream: bool,
    ) -> Result<Message, GatewayError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|length| length > limit) {
            return Err(GatewayError::RequestTooLarge { limit });
        }
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ContentType::parse);

        let mut message = Message::new();
        message.set_body_limit(Some(limit));
        if stream {
            let stream: BodyStream = Box::pin(body.into_data_stream().map_err(io::Error::other));
            message.initialize_streaming(
                content_type.unwrap_or_else(ContentType::octet_stream),
                limit_stream(stream, limit),
                declared,
            );
            return Ok(message);
        }

        let mut stash = self.stash_factory.create(Some(limit));
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| MessageError::Io(io::Error::other(e)))?;
            stash.write(chunk).map_err(|e| match e {
                StashError::LimitExceeded { limit } => GatewayError::RequestTooLarge { limit },
                other => GatewayError::Message(MessageError::Stash(other)),
            })?;
        }
        match content_type {
            Some(content_type) => message.initialize_stashed(content_type, stash),
            None if !stash.is_empty() => message.initialize_stashed(ContentType::octet_stream(), stash),
            None => {}
        }
        Ok(message)
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn handle(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    gateway.exchange(request).await
}

/// Render the response message produced by a successful exchange.
fn render(message: &mut Message) -> Result<Response, GatewayError> {
    let (status, mut headers) = match message.facet::<HttpResponseFacet>() {
        Some(facet) => (facet.status, facet.headers.clone()),
        None => (StatusCode::OK, HeaderMap::new()),
    };
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let body = if !message.is_initialized() {
        Body::empty()
    } else if message.is_buffering_disallowed() {
        Body::from_stream(message.take_body_stream()?)
    } else {
        Body::from(message.body_bytes()?)
    };
    if let Some(content_type) = message.content_type()
        && let Ok(value) = HeaderValue::from_str(content_type.as_str())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn soap_version(request: &mut Message) -> Option<SoapVersion> {
    if !request.is_soap() {
        return None;
    }
    request.xml().ok().and_then(SoapDocument::version)
}

/// Synthesized failure response. Carries only the error's public message
/// and safe details.
fn failure(err: &GatewayError, request_id: &str, soap: Option<SoapVersion>) -> Response {
    let status = err.http_status();
    match soap {
        Some(version) => {
            let content_type = match version {
                SoapVersion::Soap11 => "text/xml; charset=utf-8",
                SoapVersion::Soap12 => "application/soap+xml; charset=utf-8",
            };
            (status, [(header::CONTENT_TYPE, content_type)], err.to_soap_fault(version)).into_response()
        }
        None => (status, Json(err.to_error_body(request_id))).into_response(),
    }
}
