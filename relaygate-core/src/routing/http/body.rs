//! Outbound body selection and size-limited response reading.

use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::TryStreamExt;
use reqwest::Response;
use tracing::{debug, warn};

use super::client::HttpVersionPref;
use crate::message::{BodyStream, Message, MessageError};
use crate::stash::{Stash, StashError};

/// How the outbound request body is sent.
pub enum OutboundBody {
    Empty,
    /// Known length; replayable across retries and failover.
    Buffered(Bytes),
    /// One-shot; sent chunked. Cannot be replayed; `None` once sent.
    Streaming(Option<BodyStream>),
}

impl OutboundBody {
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Streaming(_))
    }

    /// Cheap copy for one send. A streaming body can only be handed out
    /// once; later calls get `None`.
    pub fn for_send(&mut self) -> Option<reqwest::Body> {
        match self {
            Self::Empty => Some(reqwest::Body::from(Bytes::new())),
            Self::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            Self::Streaming(stream) => stream.take().map(reqwest::Body::wrap_stream),
        }
    }
}

impl std::fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffered(b) => f.debug_tuple("Buffered").field(&b.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Pick the body mode for `message`.
///
/// A message that disallows buffering is streamed, except under HTTP/1.0
/// (no chunked transfer) where it is collected first, up to the message's
/// ceiling. Everything else is sent with a known length.
///
/// # Errors
///
/// Propagates [`MessageError`] from reading the body, including
/// [`MessageError::SizeExceeded`].
pub async fn choose_body_mode(
    message: &mut Message,
    version: HttpVersionPref,
) -> Result<OutboundBody, MessageError> {
    if !message.is_initialized() {
        return Ok(OutboundBody::Empty);
    }
    if !message.is_buffering_disallowed() {
        return Ok(OutboundBody::Buffered(message.body_bytes()?));
    }

    let stream = message.take_body_stream()?;
    if version.allows_chunked() {
        return Ok(OutboundBody::Streaming(Some(stream)));
    }

    debug!("HTTP/1.0 backend: collecting streamed body before send");
    let limit = message.body_limit();
    let chunks: Vec<Bytes> = stream.try_collect().await.map_err(|e| match limit {
        Some(limit) if e.kind() == std::io::ErrorKind::InvalidData => MessageError::SizeExceeded {
            limit,
            actual: limit.saturating_add(1),
        },
        _ => MessageError::Io(e),
    })?;
    Ok(OutboundBody::Buffered(Bytes::from(chunks.concat())))
}

/// Gzip-encode `bytes`.
///
/// # Errors
///
/// I/O errors from the encoder.
pub fn gzip(bytes: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Why a response body could not be read.
#[derive(Debug, thiserror::Error)]
pub enum BodyReadError {
    #[error("response body exceeds {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("response body read failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body store failed: {0}")]
    Store(std::io::Error),
}

impl From<StashError> for BodyReadError {
    fn from(e: StashError) -> Self {
        match e {
            StashError::LimitExceeded { limit } => Self::TooLarge { limit },
            StashError::Io(io) => Self::Store(io),
        }
    }
}

/// Read `response` into `stash`, enforcing `limit`.
///
/// A declared `Content-Length` over the limit is rejected before any byte
/// is read; otherwise the limit is enforced chunk by chunk, so an oversized
/// chunked response is abandoned as soon as it crosses the ceiling.
///
/// # Errors
///
/// [`BodyReadError::TooLarge`] when over the limit, [`BodyReadError::Transport`]
/// when the connection fails mid-body.
pub async fn read_body_limited(
    mut response: Response,
    stash: &mut dyn Stash,
    limit: Option<u64>,
) -> Result<(), BodyReadError> {
    if let (Some(limit), Some(length)) = (limit, response.content_length())
        && length > limit
    {
        warn!(content_length = length, limit, "Response exceeds size limit (Content-Length)");
        return Err(BodyReadError::TooLarge { limit });
    }

    while let Some(chunk) = response.chunk().await? {
        if let Err(e) = stash.write(chunk) {
            if let StashError::LimitExceeded { limit } = &e {
                warn!(accumulated = stash.len(), limit, "Response exceeds size limit during read");
            }
            return Err(e.into());
        }
    }
    Ok(())
}
