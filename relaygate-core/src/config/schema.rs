//! Configuration schema type definitions.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::duration_format;
use crate::routing::ForwardingRule;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// # Example
/// ```yaml
/// schema: 1
///
/// services:
///   - name: orders
///     path: /orders
///     policy:
///       kind: all
///       children:
///         - kind: size_limit
///           limit: 1048576
///         - kind: http_route
///           urls: ["http://orders-a:8080${request.http.uri}"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Schema version (must be 1).
    pub schema: u32,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Queues declared on the in-process broker used by `queue_route` nodes.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Named node trees reusable through `include`.
    #[serde(default)]
    pub fragments: HashMap<String, NodeConfig>,

    pub services: Vec<ServiceConfig>,
}

impl Config {
    pub fn get_fragment(&self, name: &str) -> Option<&NodeConfig> {
        self.fragments.get(name)
    }

    /// The service whose path is the longest prefix of `path`.
    pub fn service_for(&self, path: &str) -> Option<&ServiceConfig> {
        self.service_index_for(path).map(|i| &self.services[i])
    }

    /// Position in `services` of the [`Config::service_for`] match.
    pub fn service_index_for(&self, path: &str) -> Option<usize> {
        self.services
            .iter()
            .enumerate()
            .filter(|(_, s)| path_matches(&s.path, path))
            .max_by_key(|(_, s)| s.path.trim_end_matches('/').len())
            .map(|(i, _)| i)
    }
}

fn path_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Byte ceilings applied by the proxy and routing nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Inbound request body ceiling.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,

    /// Default backend response ceiling for `http_route` nodes without one.
    #[serde(default)]
    pub max_response_bytes: Option<u64>,

    #[serde(default = "default_max_queue_message_bytes")]
    pub max_queue_message_bytes: u64,

    /// Bodies above this size spill to a temporary file. `None` keeps
    /// everything in memory.
    #[serde(default)]
    pub spill_threshold: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: None,
            max_queue_message_bytes: default_max_queue_message_bytes(),
            spill_threshold: None,
        }
    }
}

fn default_max_request_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_queue_message_bytes() -> u64 {
    crate::routing::queue::DEFAULT_MAX_MESSAGE_BYTES
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub queues: Vec<String>,
}

/// One inbound service: a path prefix and its policy tree.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub path: String,
    /// Hand the request body to the policy as a stream instead of buffering
    /// it.
    #[serde(default)]
    pub stream_requests: bool,
    pub policy: NodeConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy Nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Run children in order; stop at the first stop outcome.
    All {
        #[serde(default)]
        name: Option<String>,
        children: Vec<NodeConfig>,
    },
    /// First child that continues wins.
    OneOf {
        #[serde(default)]
        name: Option<String>,
        children: Vec<NodeConfig>,
    },
    /// Run a named fragment in a child context.
    Include {
        fragment: String,
        #[serde(default)]
        imports: Vec<String>,
        #[serde(default)]
        exports: Vec<String>,
        /// Outcome name to outcome name.
        #[serde(default)]
        remap: HashMap<String, String>,
    },
    SetVariable {
        variable: String,
        value: String,
    },
    RequireVariable {
        variable: String,
    },
    SizeLimit {
        limit: u64,
    },
    HttpRoute(HttpRouteConfig),
    QueueRoute(QueueRouteConfig),
}

impl NodeConfig {
    /// Kind name as written in the configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::All { .. } => "all",
            Self::OneOf { .. } => "one_of",
            Self::Include { .. } => "include",
            Self::SetVariable { .. } => "set_variable",
            Self::RequireVariable { .. } => "require_variable",
            Self::SizeLimit { .. } => "size_limit",
            Self::HttpRoute(_) => "http_route",
            Self::QueueRoute(_) => "queue_route",
        }
    }

    /// Direct children, for tree walks.
    pub fn children(&self) -> &[NodeConfig] {
        match self {
            Self::All { children, .. } | Self::OneOf { children, .. } => children,
            _ => &[],
        }
    }
}

/// Forwarding rules for headers or parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ForwardingConfig {
    #[default]
    PassAll,
    Subset {
        rules: Vec<ForwardingRule>,
    },
    Block,
}

/// A byte limit given either as a number or as a template expanded per
/// exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LimitSetting {
    Bytes(u64),
    Template(String),
}

impl LimitSetting {
    pub fn as_template(&self) -> String {
        match self {
            Self::Bytes(n) => n.to_string(),
            Self::Template(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityHeaderConfig {
    /// `leave`, `remove`, `clean` or `promote`.
    pub action: String,
    /// Actor whose block is promoted.
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRouteConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// URL templates.
    pub urls: Vec<String>,

    /// `sticky`, `round_robin` or `random`. Required for more than one URL
    /// to fail over; absent means the first URL only.
    #[serde(default)]
    pub failover: Option<String>,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub retry_interval: Option<Duration>,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub connect_timeout: Option<Duration>,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub read_timeout: Option<Duration>,

    #[serde(default)]
    pub max_connections_per_host: Option<usize>,

    #[serde(default)]
    pub max_connections_total: Option<usize>,

    /// Connect retries on the same URL.
    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub verify_tls: Option<bool>,

    /// PEM bundle of extra trusted CAs.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    /// `1.0`, `1.1` or `2`.
    #[serde(default)]
    pub http_version: Option<String>,

    #[serde(default)]
    pub max_response_bytes: Option<LimitSetting>,

    #[serde(default)]
    pub request_source: Option<String>,

    #[serde(default)]
    pub response_destination: Option<String>,

    #[serde(default)]
    pub request_headers: ForwardingConfig,

    #[serde(default)]
    pub response_headers: ForwardingConfig,

    #[serde(default)]
    pub request_params: ForwardingConfig,

    #[serde(default)]
    pub login: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub pass_through_authorization: bool,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub gzip_request: bool,

    #[serde(default)]
    pub stream_response: bool,

    #[serde(default)]
    pub pass_through_soap_faults: bool,

    #[serde(default)]
    pub security_header: Option<SecurityHeaderConfig>,

    #[serde(default)]
    pub assert_identity: bool,

    #[serde(default)]
    pub chain_credentials: bool,
}

/// Where a queue backend replies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplyConfig {
    None,
    #[default]
    Temporary,
    Explicit {
        destination: String,
    },
}

/// Property propagation for one direction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PropertyConfig {
    #[default]
    PassAll,
    Rules {
        rules: Vec<ForwardingRule>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueRouteConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Destination templates.
    pub destinations: Vec<String>,

    #[serde(default)]
    pub failover: Option<String>,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub retry_interval: Option<Duration>,

    /// `text`, `bytes` or `copy_request`.
    #[serde(default)]
    pub message_type: Option<String>,

    #[serde(default)]
    pub reply: ReplyConfig,

    #[serde(default)]
    pub use_message_id_for_correlation: bool,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub response_timeout: Option<Duration>,

    #[serde(default)]
    pub request_properties: PropertyConfig,

    #[serde(default)]
    pub response_properties: PropertyConfig,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub retry_delay: Option<Duration>,

    /// `never`, `transient_only` or `always`.
    #[serde(default)]
    pub naming_retry: Option<String>,

    #[serde(default)]
    pub max_sessions: Option<usize>,

    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub acquire_timeout: Option<Duration>,

    #[serde(default)]
    pub request_source: Option<String>,

    #[serde(default)]
    pub response_destination: Option<String>,

    #[serde(default)]
    pub security_header: Option<SecurityHeaderConfig>,

    #[serde(default)]
    pub assert_identity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
schema: 1
limits:
  max_request_bytes: 2048
fragments:
  audit:
    kind: set_variable
    variable: audited
    value: "yes"
services:
  - name: orders
    path: /orders
    policy:
      kind: all
      children:
        - kind: include
          fragment: audit
          exports: [audited]
        - kind: http_route
          urls: ["http://a:8080", "http://b:8080"]
          failover: round_robin
          read_timeout: 10s
          max_response_bytes: "${limit}"
          request_headers:
            mode: subset
            rules:
              - name: X-Tenant
              - name: X-Gateway
                custom_value: relaygate
  - name: billing
    path: /billing
    policy:
      kind: queue_route
      destinations: [billing.requests]
      reply:
        mode: explicit
        destination: billing.replies
      response_timeout: PT5S
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_saphyr::from_str(SAMPLE).unwrap();
        assert_eq!(config.schema, 1);
        assert_eq!(config.limits.max_request_bytes, 2048);
        assert_eq!(config.limits.max_queue_message_bytes, 5_242_880);
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.services.len(), 2);

        let orders = &config.services[0];
        assert_eq!(orders.policy.kind(), "all");
        let NodeConfig::HttpRoute(route) = &orders.policy.children()[1] else {
            panic!("expected http_route");
        };
        assert_eq!(route.urls.len(), 2);
        assert_eq!(route.read_timeout, Some(Duration::from_secs(10)));
        assert!(matches!(route.max_response_bytes, Some(LimitSetting::Template(_))));
        let ForwardingConfig::Subset { rules } = &route.request_headers else {
            panic!("expected subset");
        };
        assert_eq!(rules[1].custom_value.as_deref(), Some("relaygate"));

        let NodeConfig::QueueRoute(queue) = &config.services[1].policy else {
            panic!("expected queue_route");
        };
        assert!(matches!(queue.reply, ReplyConfig::Explicit { .. }));
        assert_eq!(queue.response_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_service_for_longest_prefix() {
        let config: Config = serde_saphyr::from_str(SAMPLE).unwrap();
        assert_eq!(config.service_for("/orders/42").map(|s| s.name.as_str()), Some("orders"));
        assert_eq!(config.service_for("/orders").map(|s| s.name.as_str()), Some("orders"));
        assert!(config.service_for("/ordersx").is_none());
        assert!(config.service_for("/other").is_none());
        assert_eq!(config.service_index_for("/billing/invoices"), Some(1));
    }
}
