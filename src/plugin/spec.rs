//! Plugin identity and capability metadata

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity record a plugin establishes through its handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl PluginSpec {
    /// Build a spec whose id and label are both `name`, dropping repeated
    /// capability names while keeping first-seen order.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        interfaces: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let name = name.into();
        let mut unique: Vec<String> = Vec::new();
        for interface in interfaces {
            let interface = interface.into();
            if !unique.contains(&interface) {
                unique.push(interface);
            }
        }

        Self {
            id: name.clone(),
            label: name,
            description: description.into(),
            interfaces: unique,
        }
    }

    pub fn implements(&self, capability: &str) -> bool {
        self.interfaces.iter().any(|i| i == capability)
    }
}

impl fmt::Display for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.label, self.interfaces.join(", "))
    }
}
