//! Type-indexed facet registry and the facets the core attaches itself.
//!
//! A facet is any `'static` value implementing [`Facet`]. The registry is
//! keyed by the facet's `TypeId`, so each facet type can be attached to a
//! message at most once. Whether a facet survives a body replacement is
//! decided by its [`FacetScope`].

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use http::{HeaderMap, Method, StatusCode, Uri};

use super::soap::SoapDocument;

/// Lifetime of a facet relative to the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetScope {
    /// Describes the transport exchange; survives `initialize`.
    Transport,
    /// Derived from the current body; dropped by `initialize`.
    Body,
}

/// Marker for values that can be attached to a [`super::Message`].
pub trait Facet: Any + Send + Sync {
    const SCOPE: FacetScope = FacetScope::Transport;
}

struct FacetEntry {
    scope: FacetScope,
    value: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub(crate) struct FacetMap {
    entries: HashMap<TypeId, FacetEntry>,
}

impl std::fmt::Debug for FacetMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacetMap")
            .field("count", &self.len())
            .finish()
    }
}

impl FacetMap {
    /// Insert unless a facet of the same type exists. Returns the rejected
    /// value on conflict.
    pub(crate) fn insert<F: Facet>(&mut self, facet: F) -> Result<(), F> {
        let key = TypeId::of::<F>();
        if self.entries.contains_key(&key) {
            return Err(facet);
        }
        self.entries.insert(
            key,
            FacetEntry {
                scope: F::SCOPE,
                value: Box::new(facet),
            },
        );
        Ok(())
    }

    pub(crate) fn get<F: Facet>(&self) -> Option<&F> {
        self.entries
            .get(&TypeId::of::<F>())
            .and_then(|e| e.value.downcast_ref::<F>())
    }

    pub(crate) fn get_mut<F: Facet>(&mut self) -> Option<&mut F> {
        self.entries
            .get_mut(&TypeId::of::<F>())
            .and_then(|e| e.value.downcast_mut::<F>())
    }

    pub(crate) fn remove<F: Facet>(&mut self) -> Option<F> {
        let entry = self.entries.remove(&TypeId::of::<F>())?;
        entry.value.downcast::<F>().ok().map(|b| *b)
    }

    pub(crate) fn contains<F: Facet>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<F>())
    }

    /// Drop every facet derived from the body.
    pub(crate) fn clear_body_scoped(&mut self) {
        self.entries.retain(|_, e| e.scope == FacetScope::Transport);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Transport facets
// ============================================================================

/// Inbound or outbound HTTP request metadata.
#[derive(Debug, Clone)]
pub struct HttpRequestFacet {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl HttpRequestFacet {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            remote_addr: None,
        }
    }

    /// Decoded query parameters in order of appearance.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First value of a header, if valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Facet for HttpRequestFacet {}

/// HTTP response metadata: the status and headers destined for the caller,
/// or received from a backend.
#[derive(Debug, Clone)]
pub struct HttpResponseFacet {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl HttpResponseFacet {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

impl Facet for HttpResponseFacet {}

/// Property value carried on a queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Double(d) => write!(f, "{d}"),
        }
    }
}

/// Queue transport metadata for a message that arrived over, or came back
/// from, a message queue.
#[derive(Debug, Clone, Default)]
pub struct QueueFacet {
    /// Binary (`true`) or text (`false`) message.
    pub bytes_message: bool,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Facet for QueueFacet {}

// ============================================================================
// Body-derived facets
// ============================================================================

/// Result of local security-header processing on this message.
#[derive(Debug, Clone, Default)]
pub struct SecurityFacet {
    /// Actor of the security header the gateway processed; `None` means the
    /// default (actorless) header.
    pub processed_actor: Option<String>,
}

impl Facet for SecurityFacet {
    const SCOPE: FacetScope = FacetScope::Body;
}

/// Cached XML/SOAP view of the body.
#[derive(Debug, Clone)]
pub struct XmlFacet(pub SoapDocument);

impl Facet for XmlFacet {
    const SCOPE: FacetScope = FacetScope::Body;
}

/// Cached JSON view of the body.
#[derive(Debug, Clone)]
pub struct JsonFacet(pub serde_json::Value);

impl Facet for JsonFacet {
    const SCOPE: FacetScope = FacetScope::Body;
}
