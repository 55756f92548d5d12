//! Case-insensitive variable storage.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::message::Message;

/// Errors from variable access and expansion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("no such variable: {name}")]
    NoSuchVariable { name: String },

    #[error("variable {name} is built in and cannot be set")]
    NotSettable { name: String },

    #[error("invalid subscript '{subscript}' for variable {name}")]
    BadSubscript { name: String, subscript: String },

    #[error("variable {name} is not a {expected}")]
    WrongType { name: String, expected: &'static str },
}

/// A typed variable value. Message-valued variables live beside these in
/// [`VariableMap`] because messages are not cloneable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

impl Value {
    /// Render as one string per element.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            other => vec![other.to_string()],
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

#[derive(Debug)]
enum Slot {
    Value(Value),
    Message(Box<Message>),
}

/// Name to value map with case-insensitive names.
///
/// The name as first written is preserved for listing.
#[derive(Debug, Default)]
pub struct VariableMap {
    slots: HashMap<String, (String, Slot)>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.slots
            .insert(Self::key(name), (name.to_string(), Slot::Value(value.into())));
    }

    pub fn set_message(&mut self, name: &str, message: Message) {
        self.slots.insert(
            Self::key(name),
            (name.to_string(), Slot::Message(Box::new(message))),
        );
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.slots.get(&Self::key(name)) {
            Some((_, Slot::Value(v))) => Some(v),
            _ => None,
        }
    }

    pub fn message(&self, name: &str) -> Option<&Message> {
        match self.slots.get(&Self::key(name)) {
            Some((_, Slot::Message(m))) => Some(m),
            _ => None,
        }
    }

    pub fn message_mut(&mut self, name: &str) -> Option<&mut Message> {
        match self.slots.get_mut(&Self::key(name)) {
            Some((_, Slot::Message(m))) => Some(m),
            _ => None,
        }
    }

    /// Remove and return a message-valued variable.
    pub fn take_message(&mut self, name: &str) -> Option<Message> {
        let key = Self::key(name);
        match self.slots.get(&key) {
            Some((_, Slot::Message(_))) => match self.slots.remove(&key) {
                Some((_, Slot::Message(m))) => Some(*m),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(&Self::key(name))
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.slots.remove(&Self::key(name)).is_some()
    }

    /// Names as originally written, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slots.values().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Names of message-valued variables, lowercased.
    pub(crate) fn message_keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().filter_map(|(k, (_, slot))| match slot {
            Slot::Message(_) => Some(k.as_str()),
            Slot::Value(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentType;

    #[test]
    fn names_are_case_insensitive() {
        let mut vars = VariableMap::new();
        vars.set("Backend.Host", "a.example");
        assert_eq!(
            vars.get("backend.host"),
            Some(&Value::String("a.example".into()))
        );
        assert!(vars.contains("BACKEND.HOST"));
        assert_eq!(vars.names(), vec!["Backend.Host"]);
    }

    #[test]
    fn message_and_value_share_namespace() {
        let mut vars = VariableMap::new();
        vars.set("reply", "text");
        vars.set_message("Reply", Message::with_body(ContentType::text(), "m"));
        assert!(vars.get("reply").is_none());
        assert!(vars.message("REPLY").is_some());

        let taken = vars.take_message("reply").unwrap();
        assert_eq!(taken.body_text().unwrap(), "m");
        assert!(vars.is_empty());
    }

    #[test]
    fn list_values_render_joined() {
        let value = Value::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(value.to_string(), "a, b");
        assert_eq!(value.to_strings().len(), 2);
        assert_eq!(Value::Int(7).to_strings(), vec!["7".to_string()]);
    }
}
