//! Header and parameter forwarding rules.
//!
//! A routing node forwards inbound headers (and query/form parameters) to
//! the backend, and backend headers to the caller, according to a
//! [`ForwardingMode`]:
//!
//! | Mode | Behaviour |
//! |------|-----------|
//! | `PassAll` | everything except connection-level headers |
//! | `Subset` | only the named entries; a rule may supply a templated value |
//! | `Block` | nothing |
//!
//! Connection-level headers (`Connection`, `Keep-Alive`, `TE`, `Upgrade`,
//! `Transfer-Encoding`, the proxy auth pair, `Host`, `Content-Length`) are
//! owned by the HTTP client and never copied, whatever the mode.

use std::fmt;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::context::{ExecutionContext, VariableExpander};

/// Which way a rule set is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound request to backend request.
    Request,
    /// Backend response to outbound response.
    Response,
}

/// One named entry of a `Subset` rule list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardingRule {
    pub name: String,
    /// Template for the forwarded value. `None` forwards the original
    /// value(s), and nothing when the original is absent.
    #[serde(default)]
    pub custom_value: Option<String>,
}

impl ForwardingRule {
    pub fn original(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            custom_value: None,
        }
    }

    pub fn custom(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            custom_value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForwardingMode {
    #[default]
    PassAll,
    Subset(Vec<ForwardingRule>),
    Block,
}

/// Applies forwarding rules. Injected through
/// [`super::RoutingServices::rule_enforcer`].
pub trait RuleEnforcer: Send + Sync + fmt::Debug {
    /// Copy headers from `source` into `dest`. Returns the names written.
    fn apply_header_rules(
        &self,
        direction: Direction,
        mode: &ForwardingMode,
        source: &HeaderMap,
        dest: &mut HeaderMap,
        ctx: &ExecutionContext,
        expander: &dyn VariableExpander,
    ) -> Vec<HeaderName>;

    /// Select parameters to forward from `source`.
    fn apply_param_rules(
        &self,
        mode: &ForwardingMode,
        source: &[(String, String)],
        ctx: &ExecutionContext,
        expander: &dyn VariableExpander,
    ) -> Vec<(String, String)>;
}

/// Default [`RuleEnforcer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRuleEnforcer;

/// Headers the HTTP client owns on either side of the gateway.
pub fn is_connection_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn expand_custom(
    rule: &ForwardingRule,
    template: &str,
    ctx: &ExecutionContext,
    expander: &dyn VariableExpander,
) -> Option<String> {
    match ctx.expand(expander, template) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(rule = %rule.name, error = %e, "Forwarding rule value not expanded; entry skipped");
            None
        }
    }
}

impl RuleEnforcer for StandardRuleEnforcer {
    fn apply_header_rules(
        &self,
        direction: Direction,
        mode: &ForwardingMode,
        source: &HeaderMap,
        dest: &mut HeaderMap,
        ctx: &ExecutionContext,
        expander: &dyn VariableExpander,
    ) -> Vec<HeaderName> {
        let mut written: Vec<HeaderName> = Vec::new();
        let mut note = |name: &HeaderName| {
            if !written.contains(name) {
                written.push(name.clone());
            }
        };

        match mode {
            ForwardingMode::Block => {}
            ForwardingMode::PassAll => {
                for (name, value) in source {
                    if is_connection_header(name.as_str()) {
                        continue;
                    }
                    dest.append(name.clone(), value.clone());
                    note(name);
                }
            }
            ForwardingMode::Subset(rules) => {
                for rule in rules {
                    let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
                        warn!(rule = %rule.name, "Invalid header name in forwarding rule");
                        continue;
                    };
                    if is_connection_header(name.as_str()) {
                        continue;
                    }
                    match &rule.custom_value {
                        Some(template) => {
                            let Some(value) = expand_custom(rule, template, ctx, expander) else {
                                continue;
                            };
                            match HeaderValue::from_str(&value) {
                                Ok(value) => {
                                    dest.insert(name.clone(), value);
                                    note(&name);
                                }
                                Err(_) => {
                                    warn!(rule = %rule.name, "Expanded header value is not valid; entry skipped");
                                }
                            }
                        }
                        None => {
                            let mut values = source.get_all(&name).iter().peekable();
                            if values.peek().is_none() {
                                continue;
                            }
                            dest.remove(&name);
                            for value in values {
                                dest.append(name.clone(), value.clone());
                            }
                            note(&name);
                        }
                    }
                }
            }
        }

        debug!(?direction, count = written.len(), "Applied header rules");
        written
    }

    fn apply_param_rules(
        &self,
        mode: &ForwardingMode,
        source: &[(String, String)],
        ctx: &ExecutionContext,
        expander: &dyn VariableExpander,
    ) -> Vec<(String, String)> {
        match mode {
            ForwardingMode::Block => Vec::new(),
            ForwardingMode::PassAll => source.to_vec(),
            ForwardingMode::Subset(rules) => {
                let mut params = Vec::new();
                for rule in rules {
                    match &rule.custom_value {
                        Some(template) => {
                            if let Some(value) = expand_custom(rule, template, ctx, expander) {
                                params.push((rule.name.clone(), value));
                            }
                        }
                        None => params.extend(
                            source
                                .iter()
                                .filter(|(name, _)| *name == rule.name)
                                .cloned(),
                        ),
                    }
                }
                params
            }
        }
    }
}
