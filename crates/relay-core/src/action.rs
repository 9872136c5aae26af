//! Stage action descriptors.
//!
//! A build target is an ordered list of [`PlannedAction`]s. Propagation
//! actions and the staleness check are interpreted by the pipeline runtime;
//! everything else is handed to an external [`StageExecutor`](crate::ports::StageExecutor).

use crate::ids::{SchedulerName, TargetName};
use crate::lock::LockRequest;
use crate::platform::CommandSpec;
use crate::properties::{BuildProperties, PropertySource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What the generic packaging sequence needs to assemble and publish a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PackagePlan {
    pub build_name: String,
    pub platform_name: String,
    pub src_path: PathBuf,
    pub dst_path: PathBuf,
    pub dst_url: String,
    pub archive_format: String,
    /// Platform packaging command used instead of the generic archive step.
    pub dist_target: Option<CommandSpec>,
    pub build_data_files: Vec<String>,
    pub platform_data_files: Vec<String>,
    pub platform_built_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackagePhase {
    Manifest,
    Archive,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageAction {
    /// Incremental update of the source tree to the branch head (or pinned revision).
    UpdateSource { repo_url: String, branch: String },
    ApplyPatches {
        base_dir: PathBuf,
        patches: Vec<String>,
    },
    /// Tell a nightly scheduler about the resolved revision without waiting.
    SignalNightly { scheduler: SchedulerName },
    /// Start a fan-out scheduler and join on every target it starts.
    TriggerFanOut {
        scheduler: SchedulerName,
        set_properties: BTreeMap<String, PropertySource>,
    },
    Clean,
    /// Compare a generated file against its source and set `property`.
    CheckStaleness {
        source: PathBuf,
        generated: PathBuf,
        property: String,
    },
    Configure { command: CommandSpec },
    Compile { command: CommandSpec },
    /// Build and run the tests natively.
    RunTests { command: CommandSpec },
    /// Build the test runner only (cross-compiled binaries cannot run here).
    BuildTestRunner { command: CommandSpec },
    Strip { command: CommandSpec },
    Package {
        phase: PackagePhase,
        plan: Box<PackagePlan>,
    },
}

impl StageAction {
    pub fn label(&self) -> &'static str {
        match self {
            StageAction::UpdateSource { .. } => "update-source",
            StageAction::ApplyPatches { .. } => "apply-patches",
            StageAction::SignalNightly { .. } => "signal-nightly",
            StageAction::TriggerFanOut { .. } => "trigger-fan-out",
            StageAction::Clean => "clean",
            StageAction::CheckStaleness { .. } => "check-staleness",
            StageAction::Configure { .. } => "configure",
            StageAction::Compile { .. } => "compile",
            StageAction::RunTests { .. } => "run-tests",
            StageAction::BuildTestRunner { .. } => "build-test-runner",
            StageAction::Strip { .. } => "strip",
            StageAction::Package { phase, .. } => match phase {
                PackagePhase::Manifest => "package-manifest",
                PackagePhase::Archive => "package-archive",
                PackagePhase::Publish => "package-publish",
            },
        }
    }

    /// Scheduler this action fires, for propagation actions.
    pub fn triggered_scheduler(&self) -> Option<(&SchedulerName, bool)> {
        match self {
            StageAction::SignalNightly { scheduler } => Some((scheduler, false)),
            StageAction::TriggerFanOut { scheduler, .. } => Some((scheduler, true)),
            _ => None,
        }
    }
}

/// Condition deciding whether an action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Guard {
    Always,
    IfFlag { property: String, default: bool },
}

impl Guard {
    pub fn if_flag(property: impl Into<String>, default: bool) -> Self {
        Guard::IfFlag {
            property: property.into(),
            default,
        }
    }

    pub fn allows(&self, properties: &BuildProperties) -> bool {
        match self {
            Guard::Always => true,
            Guard::IfFlag { property, default } => properties.flag_or(property, *default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlannedAction {
    pub name: String,
    pub action: StageAction,
    pub guard: Guard,
    /// Held for the duration of this action; consecutive actions asking for
    /// the same set keep holding it.
    pub locks: Vec<LockRequest>,
    /// Logged at debug level only when it succeeds.
    pub quiet_on_success: bool,
}

impl PlannedAction {
    pub fn new(name: impl Into<String>, action: StageAction) -> Self {
        Self {
            name: name.into(),
            action,
            guard: Guard::Always,
            locks: vec![],
            quiet_on_success: false,
        }
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_locks(mut self, locks: Vec<LockRequest>) -> Self {
        self.locks = locks;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet_on_success = true;
        self
    }
}

/// Context handed to the stage executor alongside the action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub target: TargetName,
    pub project: String,
    pub platform: Option<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Result of one stage action; the pipeline only looks at pass/fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure(String),
}

impl ActionOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        ActionOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{CLEAN, NEEDS_CONFIGURE};

    #[test]
    fn test_guard_defaults() {
        let props = BuildProperties::new();
        assert!(Guard::Always.allows(&props));
        assert!(!Guard::if_flag(CLEAN, false).allows(&props));
        assert!(Guard::if_flag(NEEDS_CONFIGURE, true).allows(&props));

        let props = props.with(NEEDS_CONFIGURE, false);
        assert!(!Guard::if_flag(NEEDS_CONFIGURE, true).allows(&props));
    }

    #[test]
    fn test_triggered_scheduler() {
        let signal = StageAction::SignalNightly {
            scheduler: SchedulerName::nightly("alpha"),
        };
        let (name, wait) = signal.triggered_scheduler().unwrap();
        assert_eq!(name, "nightly-scheduler-alpha");
        assert!(!wait);
        assert!(StageAction::Clean.triggered_scheduler().is_none());
    }
}
