//! Per-call values copied across the sandbox boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Timestamp;

/// An analytics event. Events are opaque JSON records to the engine.
pub type Event = Value;

/// Ambient metadata for a single invocation.
///
/// Copied by value into the sandbox on every call. Free-form properties are
/// flattened into the top-level object the guest sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_until: Option<Timestamp>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug_until(mut self, until: Option<Timestamp>) -> Self {
        self.debug_until = until;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Whether guest debug logging should be forwarded at `now`.
    pub fn is_debug_active(&self, now: Timestamp) -> bool {
        self.debug_until.is_some_and(|until| until > now)
    }
}

/// The user profile a batch of events belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUser {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub anonymous_id: Option<String>,
    #[serde(default)]
    pub traits: Map<String, Value>,
}

impl ProfileUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: Value) -> Self {
        self.traits.insert(key.into(), value);
        self
    }
}

/// The only value allowed back out of a sandbox on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileResult {
    pub properties: Map<String, Value>,
}

impl ProfileResult {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self { properties }
    }

    /// Normalize a guest return value.
    ///
    /// An object with a `properties` object uses it; any other object is
    /// taken as the properties map. `null`, arrays and primitives (including
    /// `undefined`, which arrives as `null`) mean "no result".
    pub fn from_guest_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(mut map) => match map.remove("properties") {
                Some(Value::Object(properties)) => Some(Self::new(properties)),
                Some(other) => {
                    map.insert("properties".to_string(), other);
                    Some(Self::new(map))
                }
                None => Some(Self::new(map)),
            },
            _ => None,
        }
    }
}
