//! Report payloads contributed by plugins
//!
//! A report is an arbitrary JSON object plus the set of plugins that
//! contributed to it. Reports merge structurally: nested objects merge key by
//! key, anything else on the right replaces the left, and the plugin sets are
//! combined with [`PluginSet::merge`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plugin::api::{PluginSet, PluginSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub plugins: PluginSet,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            plugins: PluginSet::EMPTY,
            data,
        }
    }

    /// Mark this report as produced by `spec`.
    pub fn tagged(mut self, spec: PluginSpec) -> Self {
        self.plugins = self.plugins.add([spec]);
        self
    }

    /// Right-biased structural merge; neither input changes.
    pub fn merge(&self, other: &Report) -> Report {
        let mut data = self.data.clone();
        merge_objects(&mut data, &other.data);
        Report {
            plugins: self.plugins.merge(&other.plugins),
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.data.is_empty()
    }
}

fn merge_objects(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming)
            }
            _ => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}
