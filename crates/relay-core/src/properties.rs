//! Build properties.
//!
//! Properties are attached when a scheduler fires and flow downward along
//! trigger edges: resolved revision, `clean`, `package`, and the values stage
//! actions derive while running (such as `needs_configure`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GOT_REVISION: &str = "got_revision";
pub const CLEAN: &str = "clean";
pub const PACKAGE: &str = "package";
pub const NEEDS_CONFIGURE: &str = "needs_configure";
pub const REASON: &str = "reason";
pub const REPOSITORY: &str = "repository";
pub const BRANCH: &str = "branch";
pub const PROJECT: &str = "project";
pub const PLATFORM_NAME: &str = "platformname";
pub const WORKER_IMAGE: &str = "workerimage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Text(String),
}

impl PropertyValue {
    /// Truthiness: `false` and the empty string are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            PropertyValue::Bool(b) => *b,
            PropertyValue::Text(s) => !s.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Bool(_) => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

/// How a property is computed when a target triggers a downstream scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PropertySource {
    /// Copy the value from the triggering build; leave unset when missing.
    Inherit,
    /// Copy the value, falling back to the default when missing or false.
    InheritOr(PropertyValue),
    Fixed(PropertyValue),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BuildProperties {
    values: BTreeMap<String, PropertyValue>,
}

impl BuildProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(PropertyValue::as_str)
    }

    /// Boolean view of a property, `default` when unset.
    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .map(PropertyValue::is_truthy)
            .unwrap_or(default)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flag_or(key, false)
    }

    pub fn revision(&self) -> Option<&str> {
        self.text(GOT_REVISION).filter(|r| !r.is_empty())
    }

    pub fn clean(&self) -> bool {
        self.flag(CLEAN)
    }

    pub fn package(&self) -> bool {
        self.flag(PACKAGE)
    }

    /// Overlay `other` on top of these properties.
    pub fn merge(&mut self, other: &BuildProperties) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Properties handed to a downstream build, computed from these ones.
    pub fn propagate(&self, sources: &BTreeMap<String, PropertySource>) -> BuildProperties {
        let mut out = BuildProperties::new();
        for (key, source) in sources {
            let value = match source {
                PropertySource::Inherit => self.values.get(key).cloned(),
                PropertySource::InheritOr(default) => Some(
                    self.values
                        .get(key)
                        .filter(|v| v.is_truthy())
                        .cloned()
                        .unwrap_or_else(|| default.clone()),
                ),
                PropertySource::Fixed(value) => Some(value.clone()),
            };
            if let Some(value) = value {
                out.values.insert(key.clone(), value);
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
