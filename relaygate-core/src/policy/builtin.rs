//! Leaf nodes for variables and size checks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{NodeResult, Outcome, PolicyNode};
use crate::context::{ExecutionContext, VariableExpander};

/// Sets a variable from a template.
pub struct SetVariableNode {
    name: String,
    variable: String,
    template: String,
    expander: Arc<dyn VariableExpander>,
}

impl SetVariableNode {
    pub fn new(
        variable: impl Into<String>,
        template: impl Into<String>,
        expander: Arc<dyn VariableExpander>,
    ) -> Self {
        let variable = variable.into();
        Self {
            name: format!("set:{variable}"),
            variable,
            template: template.into(),
            expander,
        }
    }
}

#[async_trait]
impl PolicyNode for SetVariableNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        let value = match ctx.expand(self.expander.as_ref(), &self.template) {
            Ok(value) => value,
            Err(e) => {
                warn!(request_id = %ctx.request_id(), variable = %self.variable, error = %e, "Template expansion failed");
                return Ok(Outcome::ServerError);
            }
        };
        match ctx.set_variable(&self.variable, value) {
            Ok(()) => Ok(Outcome::Continue),
            Err(e) => {
                warn!(request_id = %ctx.request_id(), error = %e, "Variable assignment failed");
                Ok(Outcome::ServerError)
            }
        }
    }
}

/// Falsified unless the variable is defined.
pub struct RequireVariableNode {
    name: String,
    variable: String,
}

impl RequireVariableNode {
    pub fn new(variable: impl Into<String>) -> Self {
        let variable = variable.into();
        Self {
            name: format!("require:{variable}"),
            variable,
        }
    }
}

#[async_trait]
impl PolicyNode for RequireVariableNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        let defined = ctx.variable(&self.variable).is_ok()
            || ctx.message_variable(&self.variable).is_ok();
        if defined {
            Ok(Outcome::Continue)
        } else {
            debug!(request_id = %ctx.request_id(), variable = %self.variable, "Required variable missing");
            Ok(Outcome::Falsified)
        }
    }
}

/// Caps the request body.
///
/// A body of known length over the limit stops immediately. A streaming body
/// of unknown length gets the ceiling attached so that the transport read
/// fails once the limit is passed.
pub struct SizeLimitNode {
    limit: u64,
}

impl SizeLimitNode {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl PolicyNode for SizeLimitNode {
    fn name(&self) -> &str {
        "size_limit"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> NodeResult {
        let request = ctx.request_mut();
        let ceiling = request.body_limit().map_or(self.limit, |l| l.min(self.limit));
        request.set_body_limit(Some(ceiling));

        match request.content_length() {
            Some(len) if len > self.limit => {
                debug!(length = len, limit = self.limit, "Request body over limit");
                Ok(Outcome::SizeExceeded)
            }
            _ => Ok(Outcome::Continue),
        }
    }
}
