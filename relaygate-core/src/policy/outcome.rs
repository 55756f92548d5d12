//! Policy outcomes and the abort signal.

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Closed set of results a policy node can return.
///
/// [`Outcome::Continue`] is the single success value. Every other value is a
/// stop that halts the current branch unless a containing node catches and
/// re-classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Proceed to the next node.
    Continue,
    /// A check evaluated to false.
    Falsified,
    /// The message is malformed or otherwise unacceptable.
    BadRequest,
    /// Credentials are missing.
    AuthRequired,
    /// Credentials were presented but are not sufficient.
    Unauthorized,
    /// The node does not apply to this message.
    NotApplicable,
    /// A body exceeded its ceiling.
    SizeExceeded,
    /// Routing failed; the backend was unreachable or never answered.
    Failed,
    /// Internal error.
    ServerError,
}

impl Outcome {
    pub fn is_continue(self) -> bool {
        self == Self::Continue
    }

    pub fn is_stop(self) -> bool {
        !self.is_continue()
    }

    /// HTTP status used when the gateway synthesizes a response for this
    /// outcome.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Continue => StatusCode::OK,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::SizeExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Failed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Falsified | Self::NotApplicable | Self::ServerError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Falsified => "falsified",
            Self::BadRequest => "bad_request",
            Self::AuthRequired => "auth_required",
            Self::Unauthorized => "unauthorized",
            Self::NotApplicable => "not_applicable",
            Self::SizeExceeded => "size_exceeded",
            Self::Failed => "failed",
            Self::ServerError => "server_error",
        }
    }

    /// Caller-facing message. Never carries internal detail.
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Continue => "OK",
            Self::Falsified | Self::NotApplicable => "Policy falsified",
            Self::BadRequest => "Bad request",
            Self::AuthRequired => "Authentication required",
            Self::Unauthorized => "Access denied",
            Self::SizeExceeded => "Message too large",
            Self::Failed => "Service unavailable",
            Self::ServerError => "Internal server error",
        }
    }

    /// Parse a configuration name such as `falsified` or `bad_request`.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "continue" | "none" => Self::Continue,
            "falsified" => Self::Falsified,
            "bad_request" => Self::BadRequest,
            "auth_required" => Self::AuthRequired,
            "unauthorized" => Self::Unauthorized,
            "not_applicable" => Self::NotApplicable,
            "size_exceeded" => Self::SizeExceeded,
            "failed" => Self::Failed,
            "server_error" => Self::ServerError,
            _ => return None,
        })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured abort carrying a pre-decided [`Outcome`].
///
/// Reserved for unwinding several call levels inside one node. Expected
/// failures return an outcome directly. Composite nodes convert aborts from
/// their children into outcomes, so an abort never crosses the policy tree
/// boundary.
#[derive(Debug, Clone, Error)]
#[error("policy aborted with {outcome}: {reason}")]
pub struct AbortSignal {
    pub outcome: Outcome,
    pub reason: String,
}

impl AbortSignal {
    pub fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }

    pub fn server_error(reason: impl Into<String>) -> Self {
        Self::new(Outcome::ServerError, reason)
    }
}

/// Result of running one node.
pub type NodeResult = Result<Outcome, AbortSignal>;
