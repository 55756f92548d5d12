//! Queue message property propagation.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::context::{ExecutionContext, VariableExpander};
use crate::message::PropertyValue;
use crate::routing::rules::ForwardingRule;

/// Provider-reserved property prefixes, never copied by pass-all.
const RESERVED_PREFIXES: [&str; 2] = ["JMS_", "JMSX"];

/// How properties are copied in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropertyMode {
    /// Copy every property except provider-reserved ones.
    #[default]
    PassAll,
    /// Copy or set only the listed properties.
    Rules(Vec<ForwardingRule>),
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Properties to put on the target message.
///
/// A rule with a custom value sets that (expanded) value as a string whether
/// or not the source carries the property; a plain rule copies the source
/// value when present.
pub fn propagate(
    mode: &PropertyMode,
    source: &BTreeMap<String, PropertyValue>,
    ctx: &ExecutionContext,
    expander: &dyn VariableExpander,
) -> BTreeMap<String, PropertyValue> {
    match mode {
        PropertyMode::PassAll => source
            .iter()
            .filter(|(name, _)| !is_reserved(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        PropertyMode::Rules(rules) => {
            let mut out = BTreeMap::new();
            for rule in rules {
                match rule.custom_value.as_deref() {
                    Some(template) => match ctx.expand(expander, template) {
                        Ok(value) => {
                            out.insert(rule.name.clone(), PropertyValue::String(value));
                        }
                        Err(e) => {
                            warn!(property = %rule.name, error = %e, "Property value not expanded; skipped");
                        }
                    },
                    None => {
                        if let Some(value) = source.get(&rule.name) {
                            out.insert(rule.name.clone(), value.clone());
                        } else {
                            debug!(property = %rule.name, "Property absent on source");
                        }
                    }
                }
            }
            out
        }
    }
}
