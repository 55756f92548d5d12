//! Capability-faceted messages.
//!
//! A [`Message`] is one direction of an exchange: a body plus a registry of
//! facets (transport metadata, parsed views, security results). The body is
//! in one of three states:
//!
//! - **empty**: never initialized.
//! - **stashed**: held in a [`Stash`]; readable any number of times.
//! - **streaming**: a one-shot stream for bodies that must not be buffered.
//!
//! # Size ceiling
//!
//! An optional byte ceiling is enforced whenever the body is read. Reads of
//! a larger body fail with [`MessageError::SizeExceeded`]; nothing is
//! truncated.
//!
//! # Facets
//!
//! Facets are looked up by type. Absence is a normal answer: [`Message::facet`]
//! returns `None` rather than failing. Replacing the body drops facets whose
//! scope is [`FacetScope::Body`], so a cached XML view never outlives the body
//! it was parsed from.

pub mod content_type;
pub mod facet;
pub mod soap;

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use thiserror::Error;

use crate::stash::{MemoryStash, Stash, StashError};

pub use content_type::ContentType;
pub use facet::{
    Facet, FacetScope, HttpRequestFacet, HttpResponseFacet, JsonFacet, PropertyValue, QueueFacet,
    SecurityFacet, XmlFacet,
};
pub use soap::{SecurityBlock, SoapDocument, SoapVersion};

use facet::FacetMap;

/// A body delivered chunk by chunk.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Errors from message body and facet operations.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A facet of this type is already attached.
    #[error("facet {facet} already attached")]
    AlreadyAttached { facet: &'static str },

    /// The body was never initialized.
    #[error("message not initialized")]
    NotInitialized,

    /// The body is a one-shot stream and cannot be buffered.
    #[error("message body may not be buffered")]
    BufferingDisallowed,

    /// The one-shot stream was already taken.
    #[error("message body already consumed")]
    BodyConsumed,

    /// Body is larger than the configured ceiling.
    #[error("message body of {actual} bytes exceeds {limit} byte limit")]
    SizeExceeded { limit: u64, actual: u64 },

    #[error("XML error: {details}")]
    Xml { details: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body store error: {0}")]
    Stash(#[from] StashError),

    /// A streamed body failed mid-read.
    #[error("body stream error: {0}")]
    Io(#[from] io::Error),
}

enum Body {
    Empty,
    Stashed(Box<dyn Stash>),
    Streaming {
        stream: Mutex<Option<BodyStream>>,
        length: Option<u64>,
    },
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Stashed(stash) => f.debug_tuple("Stashed").field(&stash.len()).finish(),
            Self::Streaming { length, .. } => {
                f.debug_struct("Streaming").field("length", length).finish()
            }
        }
    }
}

/// One direction (request or response) of an exchange.
#[derive(Debug)]
pub struct Message {
    body: Body,
    content_type: Option<ContentType>,
    facets: FacetMap,
    body_limit: Option<u64>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Self {
            body: Body::Empty,
            content_type: None,
            facets: FacetMap::default(),
            body_limit: None,
        }
    }

    /// Convenience constructor for an in-memory body.
    pub fn with_body(content_type: ContentType, content: impl Into<Bytes>) -> Self {
        let mut message = Self::new();
        message.initialize(content_type, content);
        message
    }

    // ------------------------------------------------------------------------
    // Body
    // ------------------------------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        !matches!(self.body, Body::Empty)
    }

    /// Replace the body with in-memory content. Safe to call repeatedly.
    pub fn initialize(&mut self, content_type: ContentType, content: impl Into<Bytes>) {
        self.initialize_stashed(
            content_type,
            Box::new(MemoryStash::from_bytes(content.into())),
        );
    }

    /// Replace the body with an already-filled stash.
    pub fn initialize_stashed(&mut self, content_type: ContentType, stash: Box<dyn Stash>) {
        self.body = Body::Stashed(stash);
        self.content_type = Some(content_type);
        self.facets.clear_body_scoped();
    }

    /// Replace the body with a one-shot stream. Buffered reads of this body
    /// fail with [`MessageError::BufferingDisallowed`].
    pub fn initialize_streaming(
        &mut self,
        content_type: ContentType,
        stream: BodyStream,
        length: Option<u64>,
    ) {
        self.body = Body::Streaming {
            stream: Mutex::new(Some(stream)),
            length,
        };
        self.content_type = Some(content_type);
        self.facets.clear_body_scoped();
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    /// Body length, when known without consuming the body.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            Body::Empty => Some(0),
            Body::Stashed(stash) => Some(stash.len()),
            Body::Streaming { length, .. } => *length,
        }
    }

    /// True when the body is a one-shot stream.
    pub fn is_buffering_disallowed(&self) -> bool {
        matches!(self.body, Body::Streaming { .. })
    }

    pub fn set_body_limit(&mut self, limit: Option<u64>) {
        self.body_limit = limit;
    }

    pub fn body_limit(&self) -> Option<u64> {
        self.body_limit
    }

    fn check_limit(&self, actual: u64) -> Result<(), MessageError> {
        match self.body_limit {
            Some(limit) if actual > limit => Err(MessageError::SizeExceeded { limit, actual }),
            _ => Ok(()),
        }
    }

    /// Read the whole body. Repeatable for stashed bodies.
    ///
    /// # Errors
    ///
    /// - [`MessageError::NotInitialized`] for an empty message
    /// - [`MessageError::BufferingDisallowed`] for a streaming body
    /// - [`MessageError::SizeExceeded`] when the body is over the ceiling
    pub fn body_bytes(&self) -> Result<Bytes, MessageError> {
        match &self.body {
            Body::Empty => Err(MessageError::NotInitialized),
            Body::Streaming { .. } => Err(MessageError::BufferingDisallowed),
            Body::Stashed(stash) => {
                self.check_limit(stash.len())?;
                Ok(stash.read_all()?)
            }
        }
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> Result<String, MessageError> {
        let bytes = self.body_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Obtain the body as a stream with the ceiling enforced per chunk.
    ///
    /// Stashed bodies stay readable afterwards; a streaming body can be taken
    /// exactly once.
    pub fn take_body_stream(&mut self) -> Result<BodyStream, MessageError> {
        let stream: BodyStream = match &self.body {
            Body::Empty => return Err(MessageError::NotInitialized),
            Body::Stashed(stash) => {
                self.check_limit(stash.len())?;
                let bytes = stash.read_all()?;
                Box::pin(stream::iter([Ok::<_, io::Error>(bytes)]))
            }
            Body::Streaming { stream, length } => {
                if let Some(len) = length {
                    self.check_limit(*len)?;
                }
                stream.lock().take().ok_or(MessageError::BodyConsumed)?
            }
        };
        Ok(match self.body_limit {
            Some(limit) => limit_stream(stream, limit),
            None => stream,
        })
    }

    // ------------------------------------------------------------------------
    // Facets
    // ------------------------------------------------------------------------

    /// Attach a facet.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::AlreadyAttached`] when a facet of the same type
    /// is present. Detach it first, or re-initialize the body for
    /// body-scoped facets.
    pub fn attach<F: Facet>(&mut self, facet: F) -> Result<(), MessageError> {
        self.facets
            .insert(facet)
            .map_err(|_| MessageError::AlreadyAttached {
                facet: std::any::type_name::<F>(),
            })
    }

    /// Attach, replacing any existing facet of the same type.
    pub fn replace<F: Facet>(&mut self, facet: F) -> Option<F> {
        let previous = self.facets.remove::<F>();
        // Cannot conflict: the slot was just emptied.
        let _ = self.facets.insert(facet);
        previous
    }

    pub fn facet<F: Facet>(&self) -> Option<&F> {
        self.facets.get::<F>()
    }

    pub fn facet_mut<F: Facet>(&mut self) -> Option<&mut F> {
        self.facets.get_mut::<F>()
    }

    pub fn detach<F: Facet>(&mut self) -> Option<F> {
        self.facets.remove::<F>()
    }

    pub fn has_facet<F: Facet>(&self) -> bool {
        self.facets.contains::<F>()
    }

    // ------------------------------------------------------------------------
    // Parsed views
    // ------------------------------------------------------------------------

    /// Parsed XML view, parsed on first access and cached until the body
    /// changes.
    pub fn xml(&mut self) -> Result<&SoapDocument, MessageError> {
        if !self.facets.contains::<XmlFacet>() {
            let doc = SoapDocument::parse(&self.body_bytes()?)?;
            let _ = self.facets.insert(XmlFacet(doc));
        }
        self.facets
            .get::<XmlFacet>()
            .map(|f| &f.0)
            .ok_or(MessageError::NotInitialized)
    }

    /// Parsed JSON view, cached like [`Message::xml`].
    pub fn json(&mut self) -> Result<&serde_json::Value, MessageError> {
        if !self.facets.contains::<JsonFacet>() {
            let value = serde_json::from_slice(&self.body_bytes()?)?;
            let _ = self.facets.insert(JsonFacet(value));
        }
        self.facets
            .get::<JsonFacet>()
            .map(|f| &f.0)
            .ok_or(MessageError::NotInitialized)
    }

    /// True for an XML body that parses as a SOAP envelope. Never fails;
    /// unparseable or streaming bodies are simply not SOAP.
    pub fn is_soap(&mut self) -> bool {
        if !self.content_type.as_ref().is_some_and(ContentType::is_xml) {
            return false;
        }
        self.xml().map(SoapDocument::is_soap).unwrap_or(false)
    }
}

/// Wrap `stream` so that it fails once more than `limit` bytes have passed.
pub fn limit_stream(stream: BodyStream, limit: u64) -> BodyStream {
    let mut seen: u64 = 0;
    Box::pin(stream.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body exceeds {limit} byte limit"),
            ));
        }
        Ok(chunk)
    }))
}
