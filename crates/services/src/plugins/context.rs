use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

/// Value key holding the request layer's mount point.
pub const ROUTE_PREFIX: &str = "routePrefix";

/// State shared between the host and plugins during startup.
///
/// Plugins may write to it directly from `init`; afterwards they contribute
/// only through [`ContextDelta`]s, merged last-writer-wins in load order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SharedContext {
    pub boards: Vec<String>,
    /// Signature tags allowed to moderate.
    pub moderators: BTreeSet<String>,
    pub values: BTreeMap<String, Value>,
}

impl SharedContext {
    pub fn new(boards: Vec<String>, moderators: impl IntoIterator<Item = String>) -> Self {
        Self {
            boards,
            moderators: moderators.into_iter().collect(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_route_prefix(mut self, prefix: &str) -> Self {
        self.values.insert(ROUTE_PREFIX.into(), Value::String(prefix.to_string()));
        self
    }

    /// Mount point of every route, empty when mounted at `/`.
    pub fn route_prefix(&self) -> &str {
        self.values.get(ROUTE_PREFIX).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn apply(&mut self, delta: ContextDelta) {
        self.moderators.extend(delta.add_moderators);
        for (key, value) in delta.values {
            self.values.insert(key, value);
        }
    }
}

/// Changes a context modifier wants applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextDelta {
    pub add_moderators: BTreeSet<String>,
    pub values: BTreeMap<String, Value>,
}

impl ContextDelta {
    pub fn with_moderators(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.add_moderators.extend(tags);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add_moderators.is_empty() && self.values.is_empty()
    }
}
