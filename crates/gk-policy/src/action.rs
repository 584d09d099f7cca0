// action.rs - The proposed unit of work that policy is evaluated against.
//
// An Action is built by an adapter from whatever calling convention it
// intercepts (a gateway request, a wrapped tool call, a task-loop step).
// Once built it is immutable: fields are private and only readable, so the
// evaluator, broker, and trace all see exactly the same action.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The target of an action: either a URI-like string or a structured object.
///
/// `#[serde(untagged)]` means a plain JSON string deserializes as `Uri` and a
/// JSON object as `Structured`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resource {
    /// A string target, e.g. `"customer@x.com"` or `"fs://workspace/a.txt"`.
    Uri(String),
    /// A structured target, e.g. `{"table": "users", "row": 42}`.
    Structured(serde_json::Map<String, serde_json::Value>),
}

impl Resource {
    /// The string form used for predicate matching.
    ///
    /// Structured resources match against their compact JSON encoding.
    /// `serde_json::Map` keeps keys sorted, so the encoding is stable.
    pub fn match_key(&self) -> String {
        match self {
            Resource::Uri(uri) => uri.clone(),
            Resource::Structured(map) => serde_json::Value::Object(map.clone()).to_string(),
        }
    }
}

impl Default for Resource {
    fn default() -> Self {
        Resource::Uri(String::new())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.match_key())
    }
}

impl From<&str> for Resource {
    fn from(value: &str) -> Self {
        Resource::Uri(value.to_string())
    }
}

impl From<String> for Resource {
    fn from(value: String) -> Self {
        Resource::Uri(value)
    }
}

/// A proposed tool or agent operation subject to policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    action_id: Uuid,
    tool_name: String,
    #[serde(default)]
    resource: Resource,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    caller_identity: String,
    requested_at: DateTime<Utc>,
}

impl Action {
    /// Start building an action for the given tool.
    pub fn builder(tool_name: impl Into<String>) -> ActionBuilder {
        ActionBuilder {
            tool_name: tool_name.into(),
            resource: Resource::default(),
            parameters: BTreeMap::new(),
            caller_identity: String::new(),
            action_id: None,
            requested_at: None,
        }
    }

    pub fn action_id(&self) -> Uuid {
        self.action_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn parameters(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.parameters
    }

    /// Look up a single parameter by key.
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }

    pub fn caller_identity(&self) -> &str {
        &self.caller_identity
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
}

/// Builder for [`Action`]. Consumed by [`ActionBuilder::build`].
#[derive(Debug, Clone)]
pub struct ActionBuilder {
    tool_name: String,
    resource: Resource,
    parameters: BTreeMap<String, serde_json::Value>,
    caller_identity: String,
    action_id: Option<Uuid>,
    requested_at: Option<DateTime<Utc>>,
}

impl ActionBuilder {
    pub fn resource(mut self, resource: impl Into<Resource>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn structured_resource(mut self, target: serde_json::Map<String, serde_json::Value>) -> Self {
        self.resource = Resource::Structured(target);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: BTreeMap<String, serde_json::Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn caller(mut self, caller_identity: impl Into<String>) -> Self {
        self.caller_identity = caller_identity.into();
        self
    }

    /// Pin the action id (adapters that already own an id, and tests).
    pub fn action_id(mut self, action_id: Uuid) -> Self {
        self.action_id = Some(action_id);
        self
    }

    /// Pin the request timestamp. Defaults to `Utc::now()` at build time.
    pub fn requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.requested_at = Some(at);
        self
    }

    pub fn build(self) -> Action {
        Action {
            action_id: self.action_id.unwrap_or_else(Uuid::new_v4),
            tool_name: self.tool_name,
            resource: self.resource,
            parameters: self.parameters,
            caller_identity: self.caller_identity,
            requested_at: self.requested_at.unwrap_or_else(Utc::now),
        }
    }
}
