//! Pooled HTTP transport for routing nodes.
//!
//! # Connection Pooling
//!
//! Each routing node owns one `reqwest` client, so connections are reused
//! across exchanges routed through the same node. On top of the client's
//! idle pool, two semaphores bound concurrent calls: one per backend host
//! and one for the node as a whole. Both are acquired with the connect
//! timeout as the bound; waiting longer counts as a connect timeout.
//!
//! # Error Classification
//!
//! | reqwest error | Failure reason |
//! |---------------|----------------|
//! | connect + timeout | `connect-timeout` |
//! | timeout | `read-timeout` |
//! | connect, [`HostNotFound`] in the source chain | `host-not-found` |
//! | builder (bad URL) | `bad-url` |
//! | anything else | `undefined` |
//!
//! Only connect failures are retried on the same candidate, and only while
//! the request body can be replayed.
//!
//! Names are resolved by [`SystemResolver`], so a failed lookup reaches the
//! classifier as a typed [`HostNotFound`] rather than resolver-specific text.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, Response};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::routing::FailureReason;

/// Preferred HTTP protocol version towards the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersionPref {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl HttpVersionPref {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1.0" | "http/1.0" => Some(Self::Http10),
            "1.1" | "http/1.1" => Some(Self::Http11),
            "2" | "2.0" | "h2" | "http/2" => Some(Self::Http2),
            _ => None,
        }
    }

    /// HTTP/1.0 has no chunked transfer encoding.
    pub fn allows_chunked(self) -> bool {
        self != Self::Http10
    }
}

/// Client-level settings of one routing node.
#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub connect_timeout: Duration,
    /// Bound on the whole call, response body included.
    pub read_timeout: Duration,
    pub max_connections_per_host: usize,
    pub max_connections_total: usize,
    pub pool_idle_timeout: Duration,
    pub verify_tls: bool,
    /// Extra trusted CA certificates, PEM encoded.
    pub ca_bundle_pem: Option<Vec<u8>>,
    pub version: HttpVersionPref,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_connections_per_host: 100,
            max_connections_total: 1000,
            pool_idle_timeout: Duration::from_secs(90),
            verify_tls: true,
            ca_bundle_pem: None,
            version: HttpVersionPref::Http11,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP client could not be built: {0}")]
    Build(reqwest::Error),
}

/// Classified outcome of a failed send.
#[derive(Debug)]
pub struct SendFailure {
    pub reason: FailureReason,
    pub detail: String,
    /// The connection was never established.
    pub connect_phase: bool,
}

/// The node's client plus its concurrency limits.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    settings: HttpClientSettings,
    total: Arc<Semaphore>,
    per_host: Arc<DashMap<String, Arc<Semaphore>>>,
}

/// Held for the duration of one call.
#[derive(Debug)]
pub struct CallPermit {
    _total: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

impl HttpTransport {
    /// Maximum connect retries on the same candidate.
    pub const MAX_CONNECT_RETRIES: u32 = 5;

    /// # Errors
    ///
    /// Returns [`TransportError`] when the client cannot be built. An
    /// unparsable CA bundle is logged and skipped.
    pub fn new(settings: HttpClientSettings) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .dns_resolver(Arc::new(SystemResolver))
            .timeout(settings.read_timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.max_connections_per_host)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!settings.verify_tls);

        if let Some(pem) = &settings.ca_bundle_pem {
            match reqwest::Certificate::from_pem_bundle(pem) {
                Ok(certs) => {
                    for cert in certs {
                        builder = builder.add_root_certificate(cert);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Invalid CA bundle, verifying against system roots only");
                }
            }
        }

        builder = match settings.version {
            HttpVersionPref::Http10 | HttpVersionPref::Http11 => builder.http1_only(),
            HttpVersionPref::Http2 => builder.http2_prior_knowledge(),
        };

        if !settings.verify_tls {
            warn!("TLS certificate verification disabled for routing client");
        }

        let client = builder.build().map_err(TransportError::Build)?;
        Ok(Self {
            client,
            total: Arc::new(Semaphore::new(settings.max_connections_total.max(1))),
            per_host: Arc::new(DashMap::new()),
            settings,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn settings(&self) -> &HttpClientSettings {
        &self.settings
    }

    /// Acquire the total and per-host permits, bounded by the connect
    /// timeout.
    ///
    /// # Errors
    ///
    /// A [`SendFailure`] with `connect-timeout` when no permit frees up in
    /// time.
    pub async fn acquire(&self, host: &str) -> Result<CallPermit, SendFailure> {
        let host_semaphore = self
            .per_host
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.settings.max_connections_per_host.max(1))))
            .clone();

        let bound = self.settings.connect_timeout;
        let acquire = async {
            let total = self.total.clone().acquire_owned().await;
            let host = host_semaphore.acquire_owned().await;
            (total, host)
        };
        match tokio::time::timeout(bound, acquire).await {
            Ok((Ok(total), Ok(host))) => Ok(CallPermit {
                _total: total,
                _host: host,
            }),
            Ok(_) => Err(SendFailure {
                reason: FailureReason::Undefined,
                detail: "connection limiter closed".to_string(),
                connect_phase: true,
            }),
            Err(_) => {
                warn!(host = %host, bound_ms = bound.as_millis() as u64, "Connection limit wait timed out");
                Err(SendFailure {
                    reason: FailureReason::ConnectTimeout,
                    detail: format!("no connection slot for {host} within {bound:?}"),
                    connect_phase: true,
                })
            }
        }
    }

    /// Send, retrying connect failures up to `retries` times with
    /// exponential backoff (100ms, 400ms, 1.6s, ...). `build` is called once
    /// per try; returning `None` means the body cannot be replayed and ends
    /// the retries.
    ///
    /// # Errors
    ///
    /// The last classified [`SendFailure`].
    pub async fn send_with_retry<F>(&self, retries: u32, mut build: F) -> Result<Response, SendFailure>
    where
        F: FnMut() -> Option<RequestBuilder>,
    {
        let retries = retries.min(Self::MAX_CONNECT_RETRIES);
        let mut attempt = 0u32;
        loop {
            let Some(request) = build() else {
                return Err(SendFailure {
                    reason: FailureReason::Undefined,
                    detail: "request body already consumed".to_string(),
                    connect_phase: false,
                });
            };
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let failure = classify_error(&e);
                    let retriable = failure.connect_phase && failure.reason != FailureReason::ConnectTimeout;
                    if !retriable || attempt >= retries {
                        return Err(failure);
                    }
                    let backoff = Duration::from_millis(100 * 4u64.pow(attempt));
                    warn!(
                        attempt = attempt + 1,
                        max_retries = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %failure.detail,
                        "Connection failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A name lookup that produced no address.
#[derive(Debug, Error)]
#[error("host {host} not found: {source}")]
pub struct HostNotFound {
    pub host: String,
    #[source]
    pub source: io::Error,
}

/// Resolves backend host names with the runtime's `getaddrinfo` lookup.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl reqwest::dns::Resolve for SystemResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        Box::pin(lookup(name.as_str().to_string()))
    }
}

async fn lookup(host: String) -> Result<reqwest::dns::Addrs, Box<dyn StdError + Send + Sync>> {
    let found = tokio::net::lookup_host((host.clone(), 0)).await;
    let addrs: Vec<SocketAddr> = match found {
        Ok(addrs) => addrs.collect(),
        Err(source) => return Err(Box::new(HostNotFound { host, source })),
    };
    if addrs.is_empty() {
        let source = io::Error::new(io::ErrorKind::NotFound, "no addresses");
        return Err(Box::new(HostNotFound { host, source }));
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Map a reqwest error to a failure reason.
pub fn classify_error(error: &reqwest::Error) -> SendFailure {
    let detail = error_chain(error);
    let (reason, connect_phase) = if error.is_connect() && error.is_timeout() {
        (FailureReason::ConnectTimeout, true)
    } else if error.is_timeout() {
        (FailureReason::ReadTimeout, false)
    } else if error.is_connect() {
        if lookup_failed(error) {
            (FailureReason::HostNotFound, true)
        } else {
            (FailureReason::Undefined, true)
        }
    } else if error.is_builder() {
        (FailureReason::BadUrl, false)
    } else {
        (FailureReason::Undefined, false)
    };
    debug!(reason = %reason, error = %detail, "Classified transport error");
    SendFailure {
        reason,
        detail,
        connect_phase,
    }
}

fn lookup_failed(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if cause.is::<HostNotFound>() {
            return true;
        }
        source = cause.source();
    }
    false
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
