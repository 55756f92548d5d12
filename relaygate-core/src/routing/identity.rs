//! Outbound identity: sender-vouches assertions and credential chaining.

use http::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

use crate::context::AuthenticationResult;
use crate::message::{ContentType, Message, MessageError};

/// Header and cookie name carrying a chained upstream identity.
pub const CHAINED_IDENTITY_NAME: &str = "IV_USER";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no signing key configured")]
    NoKey,

    #[error("assertion for {subject} could not be signed: {reason}")]
    Failed { subject: String, reason: String },
}

/// An issued, already-signed assertion as an XML fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAssertion {
    pub xml: String,
}

/// Issues signed identity assertions. The key material stays behind this
/// seam; the core only inserts the result into the outbound message.
pub trait AssertionSigner: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SigningError`] when the assertion cannot be produced.
    fn issue(&self, subject: &AuthenticationResult) -> Result<SignedAssertion, SigningError>;
}

/// Insert `assertion` into the default security block of a SOAP `message`,
/// creating the header and block when absent.
///
/// # Errors
///
/// [`MessageError::Xml`] when the body is not a SOAP envelope.
pub fn attach_assertion(message: &mut Message, assertion: &SignedAssertion) -> Result<(), MessageError> {
    let content_type = message.content_type().cloned().unwrap_or_else(ContentType::xml);
    let text = message
        .xml()?
        .with_default_security_content(&assertion.xml)
        .ok_or_else(|| MessageError::Xml {
            details: "identity assertion needs a SOAP envelope".to_string(),
        })?;
    message.initialize(content_type, text);
    debug!("Sender-vouches assertion attached");
    Ok(())
}

/// Add the `IV_USER` header and cookie for `user` to outbound `headers`.
/// Existing cookies are kept. A user name that is not a valid header value
/// is skipped.
pub fn chain_credentials(headers: &mut HeaderMap, user: &str) {
    let Ok(value) = HeaderValue::from_str(user) else {
        debug!("Chained user name is not a valid header value; skipped");
        return;
    };
    headers.insert(HeaderName::from_static("iv_user"), value);

    let cookie = format!("{CHAINED_IDENTITY_NAME}={user}");
    let merged = match headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}; {cookie}"),
        _ => cookie,
    };
    if let Ok(merged) = HeaderValue::from_str(&merged) {
        headers.insert(COOKIE, merged);
    }
}
