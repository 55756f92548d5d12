//! Authentication results recorded on an execution context.

use std::fmt;
use std::time::SystemTime;

/// Kind of credential the caller presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialKind {
    HttpBasic,
    ClientCertificate,
    SecurityToken,
    Other(String),
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpBasic => f.write_str("http_basic"),
            Self::ClientCertificate => f.write_str("client_certificate"),
            Self::SecurityToken => f.write_str("security_token"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// One successful authentication of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    /// Login or subject name.
    pub user: String,
    /// Identity provider that vouched for the user.
    pub provider: String,
    pub credential: CredentialKind,
    pub authenticated_at: SystemTime,
}

impl AuthenticationResult {
    pub fn new(user: impl Into<String>, provider: impl Into<String>, credential: CredentialKind) -> Self {
        Self {
            user: user.into(),
            provider: provider.into(),
            credential,
            authenticated_at: SystemTime::now(),
        }
    }
}
