//! Message-queue provider seam.
//!
//! The routing node talks to a broker only through [`QueueConnector`] and
//! [`QueueSession`]. [`super::memory::InMemoryBroker`] is the in-process
//! implementation; adapters for real brokers live outside the core.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::message::PropertyValue;

/// Body of a queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueBody {
    Text(String),
    Bytes(Bytes),
}

impl QueueBody {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::from(s),
            Self::Bytes(b) => b,
        }
    }
}

/// A message as seen by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub body: QueueBody,
    /// Assigned by the broker on send.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl QueueMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(QueueBody::Text(body.into()))
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::new(QueueBody::Bytes(body.into()))
    }

    fn new(body: QueueBody) -> Self {
        Self {
            body,
            message_id: None,
            correlation_id: None,
            reply_to: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Destination or connection factory lookup failed.
    #[error("naming lookup for {name} failed: {detail}")]
    Naming {
        name: String,
        detail: String,
        /// The directory reported a condition that may clear on retry.
        transient: bool,
    },

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("send to {destination} failed: {detail}")]
    Send { destination: String, detail: String },

    #[error("receive from {destination} failed: {detail}")]
    Receive { destination: String, detail: String },

    #[error("no session for {endpoint} within {waited:?}")]
    PoolExhausted { endpoint: String, waited: Duration },
}

impl QueueError {
    /// Whether a pre-send failure may be retried on the same endpoint.
    pub fn is_retryable(&self, naming: NamingRetryPolicy) -> bool {
        match self {
            Self::Naming { transient, .. } => naming.retries(*transient),
            Self::Connection(_) | Self::Send { .. } | Self::PoolExhausted { .. } => true,
            Self::Receive { .. } => false,
        }
    }

    /// The session that raised this error should not be reused.
    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Send { .. } | Self::Receive { .. })
    }
}

/// Which naming failures are retried before send.
///
/// Directory services differ in which lookup failures clear on their own, so
/// this is deployment configuration rather than a fixed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingRetryPolicy {
    Never,
    #[default]
    TransientOnly,
    Always,
}

impl NamingRetryPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "never" => Some(Self::Never),
            "transient_only" | "transient" => Some(Self::TransientOnly),
            "always" => Some(Self::Always),
            _ => None,
        }
    }

    fn retries(self, transient: bool) -> bool {
        match self {
            Self::Never => false,
            Self::TransientOnly => transient,
            Self::Always => true,
        }
    }
}

impl fmt::Display for NamingRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Never => "never",
            Self::TransientOnly => "transient_only",
            Self::Always => "always",
        })
    }
}

/// Opens sessions against a broker endpoint.
#[async_trait]
pub trait QueueConnector: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// [`QueueError::Naming`] when the endpoint cannot be resolved,
    /// [`QueueError::Connection`] when the broker is unreachable.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn QueueSession>, QueueError>;
}

/// One broker session. Used by a single exchange at a time.
#[async_trait]
pub trait QueueSession: Send + fmt::Debug {
    /// Send `message` to `destination`; returns the broker's message id.
    async fn send(&mut self, destination: &str, message: QueueMessage) -> Result<String, QueueError>;

    /// Create a temporary destination owned by this session.
    async fn create_temporary_queue(&mut self) -> Result<String, QueueError>;

    async fn delete_temporary_queue(&mut self, name: &str) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a message on `destination`, optionally only
    /// one whose correlation id equals `correlation_id`. `Ok(None)` on
    /// timeout.
    async fn receive(
        &mut self,
        destination: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError>;
}
