//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors. Each one prevents startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Service and fragment validation
    // ─────────────────────────────────────────────────────────────────────────
    /// No services defined.
    #[error("no services defined in configuration")]
    NoServicesDefined,

    /// Two services claim the same path prefix.
    #[error("duplicate service path: '{path}'")]
    DuplicateServicePath { path: String },

    /// Service path is not absolute.
    #[error("service path '{path}' must start with '/'")]
    InvalidServicePath { path: String },

    /// An include node names a fragment that does not exist.
    #[error("include of undefined fragment '{fragment}'")]
    UnknownFragment { fragment: String },

    /// Fragments include each other in a loop.
    #[error("fragment include cycle through '{fragment}'")]
    FragmentCycle { fragment: String },

    /// A routing node has nothing to route to.
    #[error("routing node '{node}' has no endpoints")]
    EmptyEndpoints { node: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Policy construction
    // ─────────────────────────────────────────────────────────────────────────
    /// A node could not be constructed from otherwise valid settings.
    #[error("node '{node}' could not be built: {message}")]
    NodeBuild { node: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Schema validation
    // ─────────────────────────────────────────────────────────────────────────
    /// Schema version not supported.
    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing
    // ─────────────────────────────────────────────────────────────────────────
    /// Required environment variable not set.
    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Config file not found at any search location.
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Validation warnings. The affected setting degrades to a safe default and
/// startup continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Unknown failover strategy; sticky is used.
    UnknownFailoverStrategy { node: String, strategy: String },

    /// Static URL that will fail at dispatch.
    InvalidStaticUrl { node: String, url: String, problem: String },

    /// Unrecognized enumerated setting; the default is used.
    UnknownSetting {
        node: String,
        setting: &'static str,
        value: String,
    },

    /// Fragment defined but never included.
    UnusedFragment { fragment: String },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFailoverStrategy { node, strategy } => {
                write!(f, "node '{node}': unknown failover strategy '{strategy}', using sticky")
            }
            Self::InvalidStaticUrl { node, url, problem } => {
                write!(f, "node '{node}': URL '{url}' will fail at dispatch: {problem}")
            }
            Self::UnknownSetting {
                node,
                setting,
                value,
            } => {
                write!(f, "node '{node}': unknown {setting} '{value}', using default")
            }
            Self::UnusedFragment { fragment } => {
                write!(f, "fragment '{fragment}' is never included")
            }
        }
    }
}

/// Result of configuration validation.
#[derive(Debug)]
pub struct ValidationResult {
    /// Non-fatal warnings encountered during validation.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(warnings: Vec<ValidationWarning>) -> Self {
        Self { warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::DuplicateServicePath {
            path: "/orders".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate service path: '/orders'");
    }

    #[test]
    fn test_validation_warning_display() {
        let warn = ValidationWarning::UnknownFailoverStrategy {
            node: "backend".to_string(),
            strategy: "weighted".to_string(),
        };
        assert_eq!(
            warn.to_string(),
            "node 'backend': unknown failover strategy 'weighted', using sticky"
        );
    }

    #[test]
    fn test_validation_result() {
        assert!(ValidationResult::ok().is_clean());
        let result = ValidationResult::with_warnings(vec![ValidationWarning::UnusedFragment {
            fragment: "audit".to_string(),
        }]);
        assert!(!result.is_clean());
    }
}
