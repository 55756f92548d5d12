//! Gateway-level errors and the failure responses synthesized from them.
//!
//! Module errors ([`MessageError`], [`ConfigError`](crate::config::ConfigError),
//! [`QueueError`](crate::routing::queue::provider::QueueError), ...) stay close
//! to where they arise and are mostly resolved into an [`Outcome`]. What is
//! left for the inbound side is a [`GatewayError`]: the reason the caller is
//! getting a synthesized response instead of a backend one.
//!
//! ## Caller-facing rendering
//!
//! | Request    | Body                                  |
//! |------------|---------------------------------------|
//! | SOAP 1.1   | `soap:Fault` with `faultcode`/`faultstring` |
//! | SOAP 1.2   | `soap:Fault` with `Code`/`Reason`     |
//! | other      | JSON [`ErrorBody`]                    |
//!
//! Only [`GatewayError::public_message`] and [`GatewayError::safe_details`]
//! reach the caller. The `Display` text is for logs.

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::message::{MessageError, SoapVersion};
use crate::policy::Outcome;
use crate::stash::StashError;

/// Why an exchange ended without a backend response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No service is mounted at the request path.
    #[error("no service mounted at '{path}'")]
    NoService { path: String },

    /// The inbound body is over the request ceiling.
    #[error("request body exceeds {limit} byte limit")]
    RequestTooLarge { limit: u64 },

    /// The policy tree stopped the exchange.
    #[error("policy for service '{service}' stopped with {outcome}")]
    PolicyStopped { service: String, outcome: Outcome },

    /// The inbound or outbound message body could not be handled.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// The gateway is draining and accepts no new exchanges.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// Anything unexpected. `detail` is logged, never rendered.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl GatewayError {
    pub fn policy(service: impl Into<String>, outcome: Outcome) -> Self {
        Self::PolicyStopped {
            service: service.into(),
            outcome,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NoService { .. } => StatusCode::NOT_FOUND,
            Self::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::PolicyStopped { outcome, .. } => outcome.http_status(),
            Self::Message(e) if is_size_error(e) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Message(_) => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error type name for metrics and logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::NoService { .. } => "no_service",
            Self::RequestTooLarge { .. } => "request_too_large",
            Self::PolicyStopped { .. } => "policy_stopped",
            Self::Message(e) if is_size_error(e) => "request_too_large",
            Self::Message(_) => "bad_message",
            Self::ShuttingDown => "shutting_down",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Caller-facing message. Never carries internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NoService { .. } => "No service at this path",
            Self::RequestTooLarge { .. } => Outcome::SizeExceeded.public_message(),
            Self::PolicyStopped { outcome, .. } => outcome.public_message(),
            Self::Message(e) if is_size_error(e) => Outcome::SizeExceeded.public_message(),
            Self::Message(_) => Outcome::BadRequest.public_message(),
            Self::ShuttingDown => Outcome::Failed.public_message(),
            Self::Internal { .. } => Outcome::ServerError.public_message(),
        }
    }

    /// Returns safe details for client consumption (no sensitive data).
    pub fn safe_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::NoService { path } => Some(serde_json::json!({ "path": path })),
            Self::RequestTooLarge { limit } => Some(serde_json::json!({ "limit": limit })),
            Self::PolicyStopped { outcome, .. } => {
                Some(serde_json::json!({ "outcome": outcome.as_str() }))
            }
            // Message and internal errors may echo payload or host detail.
            _ => None,
        }
    }

    /// Whether the error stems from the caller's request rather than from
    /// the gateway or a backend.
    pub fn is_client_error(&self) -> bool {
        self.http_status().is_client_error()
    }

    pub fn to_error_body(&self, request_id: &str) -> ErrorBody {
        ErrorBody {
            error: ErrorInfo {
                status: self.http_status().as_u16(),
                error_type: self.error_type_name().to_string(),
                message: self.public_message().to_string(),
                request_id: request_id.to_string(),
                details: self.safe_details(),
            },
        }
    }

    /// SOAP fault envelope for a SOAP caller.
    pub fn to_soap_fault(&self, version: SoapVersion) -> String {
        let message = quick_xml::escape::escape(self.public_message());
        let ns = version.namespace();
        match version {
            SoapVersion::Soap11 => {
                let code = if self.is_client_error() {
                    "soap:Client"
                } else {
                    "soap:Server"
                };
                format!(
                    "<soap:Envelope xmlns:soap=\"{ns}\"><soap:Body><soap:Fault>\
                     <faultcode>{code}</faultcode><faultstring>{message}</faultstring>\
                     </soap:Fault></soap:Body></soap:Envelope>"
                )
            }
            SoapVersion::Soap12 => {
                let code = if self.is_client_error() {
                    "soap:Sender"
                } else {
                    "soap:Receiver"
                };
                format!(
                    "<soap:Envelope xmlns:soap=\"{ns}\"><soap:Body><soap:Fault>\
                     <soap:Code><soap:Value>{code}</soap:Value></soap:Code>\
                     <soap:Reason><soap:Text xml:lang=\"en\">{message}</soap:Text></soap:Reason>\
                     </soap:Fault></soap:Body></soap:Envelope>"
                )
            }
        }
    }
}

fn is_size_error(e: &MessageError) -> bool {
    matches!(
        e,
        MessageError::SizeExceeded { .. } | MessageError::Stash(StashError::LimitExceeded { .. })
    )
}

/// JSON error response for non-SOAP callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    /// Correlates the response with server-side logs.
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SoapDocument;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::NoService {
                path: "/x".to_string()
            }
            .http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::policy("orders", Outcome::Failed).http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Message(MessageError::SizeExceeded {
                limit: 10,
                actual: 11
            })
            .http_status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::Message(MessageError::Stash(StashError::LimitExceeded { limit: 10 }))
                .error_type_name(),
            "request_too_large"
        );
    }

    #[test]
    fn test_internal_detail_never_rendered() {
        let err = GatewayError::Internal {
            detail: "connection refused to 10.0.0.7:5432".to_string(),
        };
        let body = serde_json::to_string(&err.to_error_body("req-1")).unwrap();
        assert!(!body.contains("10.0.0.7"));
        assert!(!body.contains("\"details\""));
        assert!(!err.to_soap_fault(SoapVersion::Soap11).contains("10.0.0.7"));
    }

    #[test]
    fn test_error_body_shape() {
        let err = GatewayError::policy("orders", Outcome::Unauthorized);
        let json = serde_json::to_value(err.to_error_body("abc")).unwrap();
        assert_eq!(json["error"]["status"], 403);
        assert_eq!(json["error"]["type"], "policy_stopped");
        assert_eq!(json["error"]["message"], "Access denied");
        assert_eq!(json["error"]["request_id"], "abc");
        assert_eq!(json["error"]["details"]["outcome"], "unauthorized");
    }

    #[test]
    fn test_soap_faults_parse_as_faults() {
        let err = GatewayError::policy("orders", Outcome::BadRequest);
        for version in [SoapVersion::Soap11, SoapVersion::Soap12] {
            let fault = err.to_soap_fault(version);
            let doc = SoapDocument::parse(fault.as_bytes()).unwrap();
            assert!(doc.is_fault());
            assert_eq!(doc.version(), Some(version));
        }
        assert!(err.to_soap_fault(SoapVersion::Soap11).contains("soap:Client"));
        assert!(
            GatewayError::ShuttingDown
                .to_soap_fault(SoapVersion::Soap12)
                .contains("soap:Receiver")
        );
    }
}
