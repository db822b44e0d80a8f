//! Resource offers as handed out by the cluster resource scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute carrying a manually pinned manager role.
pub const PERSONA_ATTRIBUTE: &str = "scaleio-persona";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub scalar: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One machine offered to the framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Offer {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: String::new(),
            hostname: hostname.into(),
            ip: String::new(),
            resources: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, scalar: f64) -> Self {
        self.resources.push(Resource {
            name: name.into(),
            scalar,
        });
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    /// Sum of all scalar resources with the given name.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.scalar)
            .sum()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Attributes as a lookup table. Later duplicates win.
    pub fn attribute_map(&self) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }
}
