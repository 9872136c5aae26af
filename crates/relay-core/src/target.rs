//! Build targets and their execution state.

use crate::action::PlannedAction;
use crate::ids::{BuildId, TargetName};
use crate::lock::{LockRequest, WorkerClass};
use crate::properties::BuildProperties;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// One per project: update sources, then fan out.
    Fetch,
    /// Pins the last observed revision as the nightly source stamp.
    Nightly,
    /// One per eligible project x platform pair.
    Platform,
}

/// A named, lock-guarded, ordered sequence of stage actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildTarget {
    pub name: TargetName,
    pub kind: TargetKind,
    pub project: String,
    #[serde(default)]
    pub platform: Option<String>,
    pub worker_class: WorkerClass,
    pub workdir: PathBuf,
    /// Held for the whole target, acquired before the first action.
    pub locks: Vec<LockRequest>,
    pub actions: Vec<PlannedAction>,
    /// Declared properties with their defaults.
    pub properties: BuildProperties,
    pub env: std::collections::BTreeMap<String, String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    /// Acquiring target-level locks.
    Locked,
    Running,
    Succeeded,
    Failed,
    Released,
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Succeeded | TargetState::Failed)
    }

    pub fn can_transition_to(&self, next: TargetState) -> bool {
        use TargetState::*;
        matches!(
            (self, next),
            (Pending, Locked)
                | (Pending, Succeeded)
                | (Locked, Running)
                | (Locked, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Released)
                | (Failed, Released)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Failure,
}

impl BuildResult {
    /// Fan-in: the worst of two results.
    pub fn worst(self, other: BuildResult) -> BuildResult {
        self.max(other)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildResult::Success)
    }
}

/// Final report of one build target instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub build_id: BuildId,
    pub target: TargetName,
    pub result: BuildResult,
    /// True when the target short-circuited without doing any work.
    pub noop: bool,
    pub failed_action: Option<String>,
    pub reason: Option<String>,
    pub properties: BuildProperties,
    /// Reports of targets started and awaited by this one.
    pub children: Vec<TargetReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TargetReport {
    /// All reports in this tree, parent first.
    pub fn flatten(&self) -> Vec<&TargetReport> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }

    pub fn find(&self, target: &str) -> Option<&TargetReport> {
        self.flatten().into_iter().find(|r| r.target == target)
    }
}
