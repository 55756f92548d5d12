//! `${name}` template expansion against context variables.
//!
//! # Syntax
//!
//! - `${name}`: value of `name`; surrounding whitespace inside the braces is
//!   ignored. Multi-valued variables are joined with `", "`.
//! - `${name|delim}`: join multi-valued variables with `delim` instead.
//! - `${name[i]}`: the `i`-th value (zero based). Out of range yields an
//!   empty string; a negative or non-numeric index is an error.
//! - `${name.length}`: number of values.
//!
//! An undefined variable expands to the empty string with a warning, unless
//! the expander is strict, in which case expansion fails with
//! [`VariableError::NoSuchVariable`]. A `${` without a closing brace is left
//! as literal text.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::variables::{VariableError, VariableMap};
use crate::message::{HttpRequestFacet, HttpResponseFacet, Message};

// SAFETY: .expect() on LazyLock with compile-time literal patterns, covered by
// test_patterns_compile().
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]*)\}").expect("BUG: REFERENCE_PATTERN regex is invalid")
});

static SUBSCRIPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\[([^\]]*)\]$").expect("BUG: SUBSCRIPT_PATTERN regex is invalid")
});

const DEFAULT_DELIMITER: &str = ", ";

/// Anything that can answer variable lookups for expansion.
pub trait VariableSource {
    /// Values of `name` rendered as strings, or `None` when undefined.
    fn lookup(&self, name: &str) -> Option<Vec<String>>;
}

/// Template expansion seam, injected into routing nodes.
pub trait VariableExpander: Send + Sync + fmt::Debug {
    /// Expand every `${...}` reference in `template`.
    ///
    /// # Errors
    ///
    /// Returns a [`VariableError`] for malformed references, and for
    /// undefined variables when the implementation is strict.
    fn expand(&self, template: &str, vars: &dyn VariableSource) -> Result<String, VariableError>;
}

/// Default [`VariableExpander`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExpander {
    strict: bool,
}

impl TemplateExpander {
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }

    fn missing(&self, name: &str) -> Result<String, VariableError> {
        if self.strict {
            return Err(VariableError::NoSuchVariable {
                name: name.to_string(),
            });
        }
        warn!(variable = %name, "Referenced variable is not defined; expanding to empty");
        Ok(String::new())
    }

    fn resolve(&self, reference: &str, vars: &dyn VariableSource) -> Result<String, VariableError> {
        let (name, delimiter) = match reference.split_once('|') {
            Some((name, delimiter)) => (name.trim(), delimiter),
            None => (reference.trim(), DEFAULT_DELIMITER),
        };

        if let Some(caps) = SUBSCRIPT_PATTERN.captures(name) {
            let base = caps.get(1).map_or("", |m| m.as_str()).trim();
            let subscript = caps.get(2).map_or("", |m| m.as_str()).trim();
            let index: usize = subscript.parse().map_err(|_| VariableError::BadSubscript {
                name: base.to_string(),
                subscript: subscript.to_string(),
            })?;
            return match vars.lookup(base) {
                Some(values) => Ok(values.get(index).cloned().unwrap_or_else(|| {
                    warn!(variable = %base, index, count = values.len(), "Subscript out of range");
                    String::new()
                })),
                None => self.missing(base),
            };
        }

        if let Some(values) = vars.lookup(name) {
            return Ok(values.join(delimiter));
        }

        if let Some(base) = strip_suffix_ignore_case(name, ".length") {
            if let Some(values) = vars.lookup(base) {
                return Ok(values.len().to_string());
            }
        }

        self.missing(name)
    }
}

impl VariableExpander for TemplateExpander {
    fn expand(&self, template: &str, vars: &dyn VariableSource) -> Result<String, VariableError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in REFERENCE_PATTERN.captures_iter(template) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            out.push_str(&self.resolve(inner.as_str(), vars)?);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

/// Names referenced by `template`, without subscripts or delimiters.
pub fn referenced_names(template: &str) -> Vec<String> {
    REFERENCE_PATTERN
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let name = m.as_str().split('|').next().unwrap_or("").trim();
            name.split('[').next().unwrap_or(name).trim().to_string()
        })
        .filter(|n| !n.is_empty())
        .collect()
}

/// True when `template` contains no references.
pub fn is_static(template: &str) -> bool {
    !REFERENCE_PATTERN.is_match(template)
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) {
        return None;
    }
    let (base, tail) = name.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(base)
}

/// Resolve an attribute of a message-valued variable, such as `mainpart` or
/// `http.header.content-type`. `suffix` must already be lowercased.
pub(crate) fn message_attribute(message: &Message, suffix: &str) -> Option<Vec<String>> {
    match suffix {
        "mainpart" => message.body_text().ok().map(|t| vec![t]),
        "contenttype" => message.content_type().map(|ct| vec![ct.to_string()]),
        "size" => message.content_length().map(|n| vec![n.to_string()]),
        "http.status" => message
            .facet::<HttpResponseFacet>()
            .map(|r| vec![r.status.as_u16().to_string()]),
        _ => {
            let header = suffix.strip_prefix("http.header.")?;
            let headers = message
                .facet::<HttpResponseFacet>()
                .map(|r| &r.headers)
                .or_else(|| message.facet::<HttpRequestFacet>().map(|r| &r.headers))?;
            let values: Vec<String> = headers
                .get_all(header)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            (!values.is_empty()).then_some(values)
        }
    }
}

/// Split `name` into a message-variable prefix and attribute suffix, trying
/// the longest candidate prefix first.
pub(crate) fn split_message_reference<'a, I>(name: &'a str, candidates: I) -> Option<(String, &'a str)>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let lower = name.to_ascii_lowercase();
    candidates
        .into_iter()
        .filter_map(|c| {
            let c = c.as_ref().to_ascii_lowercase();
            let rest = lower.strip_prefix(&c)?.strip_prefix('.')?;
            let offset = name.len() - rest.len();
            Some((c, &name[offset..]))
        })
        .max_by_key(|(c, _)| c.len())
}

impl VariableSource for VariableMap {
    fn lookup(&self, name: &str) -> Option<Vec<String>> {
        if let Some(value) = self.get(name) {
            return Some(value.to_strings());
        }
        let (prefix, suffix) = split_message_reference(name, self.message_keys())?;
        message_attribute(self.message(&prefix)?, &suffix.to_ascii_lowercase())
    }
}
