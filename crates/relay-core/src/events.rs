//! Events emitted while the pipeline runs.

use crate::ids::{BuildId, FiringId, SchedulerName, TargetName};
use crate::lock::{LockMode, LockScope, WorkerClass};
use crate::target::TargetState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SchedulerFired(SchedulerFiredPayload),
    TargetStateChanged(TargetStateChangedPayload),
    LockAcquired(LockPayload),
    LockReleased(LockPayload),
    ActionCompleted(ActionCompletedPayload),
}

impl Event {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::SchedulerFired(p) => p.fired_at,
            Event::TargetStateChanged(p) => p.at,
            Event::LockAcquired(p) | Event::LockReleased(p) => p.at,
            Event::ActionCompleted(p) => p.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerFiredPayload {
    pub firing_id: FiringId,
    pub scheduler: SchedulerName,
    pub targets: Vec<TargetName>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStateChangedPayload {
    pub build_id: BuildId,
    pub target: TargetName,
    pub worker_class: WorkerClass,
    pub state: TargetState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPayload {
    /// Name of the holding target.
    pub holder: String,
    pub build_id: Option<BuildId>,
    pub scope: LockScope,
    pub mode: LockMode,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCompletedPayload {
    pub build_id: BuildId,
    pub target: TargetName,
    pub action: String,
    pub status: ActionStatus,
    pub reason: Option<String>,
    pub completed_at: DateTime<Utc>,
}
