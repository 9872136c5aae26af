//! Scheduler (trigger graph node) definitions.

use crate::ids::{SchedulerName, TargetName};
use crate::properties::{BuildProperties, CLEAN, PACKAGE, REASON};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Boolean flag an operator may set when forcing a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ForceParameter {
    pub name: String,
    pub label: String,
    pub default: bool,
}

impl ForceParameter {
    /// `clean` and `package`, both off by default.
    pub fn standard() -> Vec<ForceParameter> {
        vec![
            ForceParameter {
                name: CLEAN.to_string(),
                label: "Clean".to_string(),
                default: false,
            },
            ForceParameter {
                name: PACKAGE.to_string(),
                label: "Package".to_string(),
                default: false,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Event-triggered: fires on a matching source change once the tree has
    /// been stable for `tree_stable_secs`.
    Change {
        repositories: Vec<String>,
        branch: String,
        tree_stable_secs: u64,
    },
    /// Time-triggered: fires daily, only when a new revision was observed.
    Nightly {
        branch: String,
        hour: u8,
        minute: u8,
        only_if_changed: bool,
    },
    /// Propagation-triggered: fires only when started by another target.
    Triggerable,
    /// Manual: fires on operator request.
    Force {
        repository: String,
        branch: String,
        parameters: Vec<ForceParameter>,
    },
}

impl SchedulerKind {
    pub fn label(&self) -> &'static str {
        match self {
            SchedulerKind::Change { .. } => "change",
            SchedulerKind::Nightly { .. } => "nightly",
            SchedulerKind::Triggerable => "triggerable",
            SchedulerKind::Force { .. } => "force",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerDef {
    pub name: SchedulerName,
    pub project: String,
    pub kind: SchedulerKind,
    /// Targets started when this scheduler fires.
    pub targets: Vec<TargetName>,
    /// Whether the triggering target waits for the started targets.
    pub wait_for_finish: bool,
}

/// Operator request for a manual build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceRequest {
    /// Free-text justification, required.
    pub reason: String,
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub package: bool,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl ForceRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn package(mut self, package: bool) -> Self {
        self.package = package;
        self
    }

    pub fn into_properties(self) -> Result<BuildProperties> {
        let reason = self.reason.trim();
        if reason.is_empty() {
            return Err(Error::MissingReason);
        }
        Ok(BuildProperties::new()
            .with(REASON, reason)
            .with(CLEAN, self.clean)
            .with(PACKAGE, self.package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_request_requires_reason() {
        assert!(matches!(
            ForceRequest::new("   ").into_properties(),
            Err(Error::MissingReason)
        ));
        let props = ForceRequest::new("rebuild after toolchain update")
            .clean(true)
            .into_properties()
            .unwrap();
        assert!(props.clean());
        assert!(!props.package());
        assert_eq!(props.text(REASON), Some("rebuild after toolchain update"));
    }
}
