//! Construction of policy trees from configuration.
//!
//! ```text
//! Config ─► PolicyBuilder ─┬─ fragments (built once, shared by every include)
//!                          └─ one PolicyTree per service
//! ```
//!
//! The configuration is expected to have passed
//! [`validate`](crate::config::validate). Settings that validation only
//! warns about degrade to their defaults here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{AllNode, IncludeNode, OneOfNode, Outcome, PolicyNode, PolicyTree};
use super::{RequireVariableNode, SetVariableNode, SizeLimitNode};
use crate::config::RelaygateDefaults;
use crate::config::error::ConfigError;
use crate::config::loader::included_fragments;
use crate::config::schema::{
    Config, ForwardingConfig, HttpRouteConfig, NodeConfig, PropertyConfig, QueueRouteConfig,
    ReplyConfig, SecurityHeaderConfig,
};
use crate::failover::DEFAULT_RETRY_INTERVAL;
use crate::routing::http::client::{HttpClientSettings, HttpVersionPref};
use crate::routing::http::{HttpRoutingConfig, HttpRoutingNode};
use crate::routing::queue::pool::PoolSettings;
use crate::routing::queue::properties::PropertyMode;
use crate::routing::queue::provider::NamingRetryPolicy;
use crate::routing::queue::{
    InMemoryBroker, OutboundMessageType, QueueConnector, QueueRoutingConfig, QueueRoutingNode,
    ReplyMode,
};
use crate::routing::{ForwardingMode, RoutingServices, SecurityHeaderAction};
use crate::stash::SpillingStashFactory;

/// Routing collaborators for `config`: a spilling stash when the config sets
/// a spill threshold, defaults otherwise.
pub fn services_for(config: &Config) -> RoutingServices {
    let services = RoutingServices::default();
    match config.limits.spill_threshold {
        Some(threshold) => {
            services.with_stash_factory(Arc::new(SpillingStashFactory { threshold }))
        }
        None => services,
    }
}

/// In-memory broker with every queue of `broker.queues` declared.
pub fn broker_for(config: &Config) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    for queue in &config.broker.queues {
        broker.declare_queue(queue);
    }
    broker
}

/// Builds [`PolicyTree`]s from a validated [`Config`].
pub struct PolicyBuilder<'a> {
    config: &'a Config,
    services: RoutingServices,
    connector: Arc<dyn QueueConnector>,
    defaults: RelaygateDefaults,
    fragments: HashMap<String, Arc<dyn PolicyNode>>,
    building: HashSet<String>,
}

impl<'a> PolicyBuilder<'a> {
    pub fn new(
        config: &'a Config,
        services: RoutingServices,
        connector: Arc<dyn QueueConnector>,
    ) -> Self {
        Self {
            config,
            services,
            connector,
            defaults: RelaygateDefaults::default(),
            fragments: HashMap::new(),
            building: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: RelaygateDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// One tree per service, in configuration order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a node cannot be constructed: unknown or
    /// cyclic fragment, empty endpoint list, unreadable CA bundle, HTTP
    /// client build failure, unknown outcome in a remap.
    pub fn build(mut self) -> Result<Vec<PolicyTree>, ConfigError> {
        let config = self.config;
        let mut trees = Vec::with_capacity(config.services.len());
        for service in &config.services {
            let root = self.node(&service.policy, &service.name)?;

            let mut referenced = Vec::new();
            referenced_fragments(config, &service.policy, &mut referenced, &mut HashSet::new());
            let fragments = referenced
                .iter()
                .filter_map(|name| self.fragments.get(*name).cloned())
                .collect();

            info!(
                service = %service.name,
                path = %service.path,
                fragments = referenced.len(),
                "Policy tree built"
            );
            trees.push(PolicyTree::new(service.name.clone(), root).with_fragments(fragments));
        }
        Ok(trees)
    }

    fn node(&mut self, node: &NodeConfig, owner: &str) -> Result<Arc<dyn PolicyNode>, ConfigError> {
        let built: Arc<dyn PolicyNode> = match node {
            NodeConfig::All { name, children } => {
                let name = name.clone().unwrap_or_else(|| format!("{owner}/all"));
                let children = self.children(children, &name)?;
                Arc::new(AllNode::new(name, children))
            }
            NodeConfig::OneOf { name, children } => {
                let name = name.clone().unwrap_or_else(|| format!("{owner}/one_of"));
                let children = self.children(children, &name)?;
                Arc::new(OneOfNode::new(name, children))
            }
            NodeConfig::Include {
                fragment,
                imports,
                exports,
                remap,
            } => {
                let body = self.fragment(fragment)?;
                Arc::new(
                    IncludeNode::new(fragment.clone(), body)
                        .with_imports(imports.clone())
                        .with_exports(exports.clone())
                        .with_remap(parse_remap(fragment, remap)?),
                )
            }
            NodeConfig::SetVariable { variable, value } => Arc::new(SetVariableNode::new(
                variable.clone(),
                value.clone(),
                self.services.expander.clone(),
            )),
            NodeConfig::RequireVariable { variable } => {
                Arc::new(RequireVariableNode::new(variable.clone()))
            }
            NodeConfig::SizeLimit { limit } => Arc::new(SizeLimitNode::new(*limit)),
            NodeConfig::HttpRoute(route) => {
                let name = route.name.clone().unwrap_or_else(|| format!("{owner}/http"));
                let settings = self.http_settings(&name, route);
                let node = HttpRoutingNode::new(name.clone(), settings, self.services.clone())
                    .map_err(|e| ConfigError::NodeBuild {
                        node: name,
                        message: e.to_string(),
                    })?;
                Arc::new(node)
            }
            NodeConfig::QueueRoute(route) => {
                let name = route.name.clone().unwrap_or_else(|| format!("{owner}/queue"));
                let settings = self.queue_settings(&name, route);
                let node = QueueRoutingNode::new(
                    name.clone(),
                    settings,
                    self.connector.clone(),
                    self.services.clone(),
                )
                .map_err(|e| ConfigError::NodeBuild {
                    node: name,
                    message: e.to_string(),
                })?;
                Arc::new(node)
            }
        };
        Ok(built)
    }

    fn children(
        &mut self,
        children: &[NodeConfig],
        owner: &str,
    ) -> Result<Vec<Arc<dyn PolicyNode>>, ConfigError> {
        children.iter().map(|c| self.node(c, owner)).collect()
    }

    fn fragment(&mut self, name: &str) -> Result<Arc<dyn PolicyNode>, ConfigError> {
        if let Some(built) = self.fragments.get(name) {
            return Ok(built.clone());
        }
        let config = self.config;
        let body = config
            .get_fragment(name)
            .ok_or_else(|| ConfigError::UnknownFragment {
                fragment: name.to_string(),
            })?;
        if !self.building.insert(name.to_string()) {
            return Err(ConfigError::FragmentCycle {
                fragment: name.to_string(),
            });
        }
        let built = self.node(body, name)?;
        self.building.remove(name);
        debug!(fragment = %name, "Fragment built");
        self.fragments.insert(name.to_string(), built.clone());
        Ok(built)
    }

    fn http_settings(&self, node: &str, route: &HttpRouteConfig) -> HttpRoutingConfig {
        let defaults = HttpRoutingConfig::default();
        let client_defaults = HttpClientSettings::default();

        let ca_bundle_pem = route.ca_bundle.as_ref().and_then(|path| match std::fs::read(path) {
            Ok(pem) => Some(pem),
            Err(e) => {
                error!(
                    node = %node,
                    path = %path.display(),
                    error = %e,
                    "CA bundle unreadable, verifying against system roots only"
                );
                None
            }
        });

        let version = match route.http_version.as_deref() {
            Some(v) => HttpVersionPref::parse(v).unwrap_or_else(|| {
                warn!(node = %node, version = %v, "Unknown HTTP version, using 1.1");
                HttpVersionPref::default()
            }),
            None => HttpVersionPref::default(),
        };

        let security_header = security_header_action(node, route.security_header.as_ref());

        let max_response_bytes = route
            .max_response_bytes
            .as_ref()
            .map(|limit| limit.as_template())
            .or_else(|| self.config.limits.max_response_bytes.map(|n| n.to_string()));

        HttpRoutingConfig {
            urls: route.urls.clone(),
            failover_strategy: route.failover.clone(),
            retry_interval: route.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            client: HttpClientSettings {
                connect_timeout: route.connect_timeout.unwrap_or(client_defaults.connect_timeout),
                read_timeout: route.read_timeout.unwrap_or(client_defaults.read_timeout),
                max_connections_per_host: route
                    .max_connections_per_host
                    .unwrap_or(client_defaults.max_connections_per_host),
                max_connections_total: route
                    .max_connections_total
                    .unwrap_or(client_defaults.max_connections_total),
                verify_tls: route.verify_tls.unwrap_or(client_defaults.verify_tls),
                ca_bundle_pem,
                version,
                ..client_defaults
            },
            retries: route.retries.unwrap_or(defaults.retries),
            max_response_bytes,
            request_source: route.request_source.clone(),
            response_destination: route.response_destination.clone(),
            request_headers: forwarding_mode(&route.request_headers),
            response_headers: forwarding_mode(&route.response_headers),
            request_params: forwarding_mode(&route.request_params),
            login: route.login.clone(),
            password: route.password.clone(),
            pass_through_authorization: route.pass_through_authorization,
            user_agent: route.user_agent.clone(),
            gzip_request: route.gzip_request,
            stream_response: route.stream_response,
            pass_through_soap_faults: route.pass_through_soap_faults,
            security_header,
            assert_identity: route.assert_identity,
            chain_credentials: route.chain_credentials,
        }
    }

    fn queue_settings(&self, node: &str, route: &QueueRouteConfig) -> QueueRoutingConfig {
        let defaults = QueueRoutingConfig::default();
        let pool_defaults = PoolSettings::default();

        let message_type = match route.message_type.as_deref() {
            Some(kind) => OutboundMessageType::parse(kind).unwrap_or_else(|| {
                warn!(node = %node, message_type = %kind, "Unknown message type, using text");
                OutboundMessageType::default()
            }),
            None => OutboundMessageType::default(),
        };

        let naming_retry = match route.naming_retry.as_deref() {
            Some(policy) => NamingRetryPolicy::parse(policy).unwrap_or_else(|| {
                warn!(node = %node, naming_retry = %policy, "Unknown naming retry policy, using default");
                NamingRetryPolicy::default()
            }),
            None => NamingRetryPolicy::default(),
        };

        let reply = match &route.reply {
            ReplyConfig::None => ReplyMode::None,
            ReplyConfig::Temporary => ReplyMode::Temporary,
            ReplyConfig::Explicit { destination } => ReplyMode::Explicit {
                destination: destination.clone(),
            },
        };

        QueueRoutingConfig {
            destinations: route.destinations.clone(),
            failover_strategy: route.failover.clone(),
            retry_interval: route.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            message_type,
            reply,
            use_message_id_for_correlation: route.use_message_id_for_correlation,
            response_timeout: route.response_timeout.unwrap_or(defaults.response_timeout),
            max_message_bytes: self.config.limits.max_queue_message_bytes,
            request_properties: property_mode(&route.request_properties),
            response_properties: property_mode(&route.response_properties),
            retry_delay: route.retry_delay.unwrap_or(self.defaults.queue_retry_delay),
            naming_retry,
            pool: PoolSettings {
                max_sessions: route.max_sessions.unwrap_or(pool_defaults.max_sessions),
                acquire_timeout: route.acquire_timeout.unwrap_or(pool_defaults.acquire_timeout),
            },
            request_source: route.request_source.clone(),
            response_destination: route.response_destination.clone(),
            security_header: security_header_action(node, route.security_header.as_ref()),
            assert_identity: route.assert_identity,
        }
    }
}

fn security_header_action(node: &str, config: Option<&SecurityHeaderConfig>) -> SecurityHeaderAction {
    match config {
        Some(header) => SecurityHeaderAction::parse(&header.action, header.actor.as_deref())
            .unwrap_or_else(|| {
                warn!(node = %node, action = %header.action, "Unknown security header action, leaving header");
                SecurityHeaderAction::Leave
            }),
        None => SecurityHeaderAction::Leave,
    }
}

fn referenced_fragments<'c>(
    config: &'c Config,
    node: &'c NodeConfig,
    out: &mut Vec<&'c str>,
    seen: &mut HashSet<&'c str>,
) {
    for name in included_fragments(node) {
        if seen.insert(name) {
            out.push(name);
            if let Some(body) = config.get_fragment(name) {
                referenced_fragments(config, body, out, seen);
            }
        }
    }
}

fn forwarding_mode(config: &ForwardingConfig) -> ForwardingMode {
    match config {
        ForwardingConfig::PassAll => ForwardingMode::PassAll,
        ForwardingConfig::Subset { rules } => ForwardingMode::Subset(rules.clone()),
        ForwardingConfig::Block => ForwardingMode::Block,
    }
}

fn property_mode(config: &PropertyConfig) -> PropertyMode {
    match config {
        PropertyConfig::PassAll => PropertyMode::PassAll,
        PropertyConfig::Rules { rules } => PropertyMode::Rules(rules.clone()),
    }
}

fn parse_remap(
    fragment: &str,
    remap: &HashMap<String, String>,
) -> Result<HashMap<Outcome, Outcome>, ConfigError> {
    remap
        .iter()
        .map(|(from, to)| {
            let parse = |name: &str| {
                Outcome::parse(name).ok_or_else(|| ConfigError::NodeBuild {
                    node: format!("include:{fragment}"),
                    message: format!("unknown outcome '{name}' in remap"),
                })
            };
            Ok((parse(from)?, parse(to)?))
        })
        .collect()
}
