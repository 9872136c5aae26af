//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! external collaborators: stage executors, change sources, persisted state
//! and event consumers.

use crate::Result;
use crate::action::{ActionContext, ActionOutcome, StageAction};
use crate::events::Event;
use crate::properties::BuildProperties;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Executes opaque stage actions (fetch, configure, compile, test, package).
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run one action. Executors may record derived values such as the
    /// resolved revision into `properties`.
    async fn execute(
        &self,
        action: &StageAction,
        ctx: &ActionContext,
        properties: &mut BuildProperties,
    ) -> ActionOutcome;
}

/// Receives pipeline events.
///
/// Emission is synchronous so that lock release can be reported from `Drop`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// A change observed on a watched repository branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub repository: String,
    pub branch: String,
    pub revision: String,
    pub observed_at: DateTime<Utc>,
}

impl Change {
    pub fn new(
        repository: impl Into<String>,
        branch: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            revision: revision.into(),
            observed_at: Utc::now(),
        }
    }
}

/// Source of change notifications (for example a repository poller).
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Changes observed since the previous call.
    async fn poll(&self) -> Result<Vec<Change>>;
}

/// Nightly bookkeeping of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyStamp {
    /// Last revision reported by the fetch target.
    pub observed: Option<String>,
    /// Revision of the last successful nightly build.
    pub fired: Option<String>,
}

impl NightlyStamp {
    pub fn has_new_revision(&self) -> bool {
        self.observed.is_some() && self.observed != self.fired
    }

    /// Apply one update; returns whether the stamp changed.
    pub fn apply(&mut self, update: &StampUpdate) -> bool {
        let (slot, revision) = match update {
            StampUpdate::Observed(revision) => (&mut self.observed, revision),
            StampUpdate::Fired(revision) => (&mut self.fired, revision),
        };
        if slot.as_deref() == Some(revision.as_str()) {
            return false;
        }
        *slot = Some(revision.clone());
        true
    }
}

/// Single-field change to a [`NightlyStamp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampUpdate {
    Observed(String),
    Fired(String),
}

/// Persisted state touched by the core.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last revision seen by the change poller of a project.
    async fn poller_revision(&self, project: &str) -> Result<Option<String>>;

    async fn set_poller_revision(&self, project: &str, revision: &str) -> Result<()>;

    async fn nightly_stamp(&self, project: &str) -> Result<NightlyStamp>;

    /// Read, update and write back a project's stamp as one step with
    /// respect to every other writer of the store, including other processes.
    async fn update_nightly_stamp(
        &self,
        project: &str,
        update: StampUpdate,
    ) -> Result<NightlyStamp>;
}
