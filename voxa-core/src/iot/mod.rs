//! Declarative IoT entities exposed to the conversational backend.
//!
//! An entity is an immutable descriptor (name, properties, methods) plus a
//! mutable property-state map. The backend learns the schema from the
//! descriptor envelope, observes state through delta envelopes, and acts by
//! invoking methods — which the engine surfaces as `IotInvocation` events
//! for the host to execute. The runtime never dispatches device side
//! effects itself.

pub mod entity;
pub mod registry;

pub use entity::{Entity, Method, MethodParam, Property};
pub use registry::{IotCommand, Registry};

use serde::{Deserialize, Serialize};

/// A property or parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Number,
            Value::Text(_) => ValueType::Text,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// Declared type of a property or method parameter.
///
/// Wire names are what the backend schema expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "boolean")]
    Bool,
    #[serde(rename = "string")]
    Text,
    #[serde(rename = "number")]
    Number,
}

impl ValueType {
    /// Wire name used in descriptor JSON.
    pub fn wire_name(self) -> &'static str {
        match self {
            ValueType::Bool => "boolean",
            ValueType::Text => "string",
            ValueType::Number => "number",
        }
    }
}
