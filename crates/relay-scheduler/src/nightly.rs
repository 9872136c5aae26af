//! Nightly snapshot timing and bookkeeping.

use chrono::{DateTime, TimeZone};
use cron::Schedule;
use relay_core::ports::{StampUpdate, StateStore};
use relay_core::project::NightlySchedule;
use relay_core::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;

/// Next time strictly after `after` at which the schedule fires.
pub fn next_fire<Tz: TimeZone>(
    schedule: &NightlySchedule,
    after: &DateTime<Tz>,
) -> Result<DateTime<Tz>> {
    let expression = schedule.cron_expression();
    let cron = Schedule::from_str(&expression)
        .map_err(|e| Error::Internal(format!("Invalid cron expression {expression}: {e}")))?;
    cron.after(after)
        .next()
        .ok_or_else(|| Error::Internal(format!("Schedule {expression} never fires")))
}

/// Revision bookkeeping of the nightly recorder.
///
/// The fetch target reports every revision it resolves; a nightly firing is
/// only worth doing when that revision differs from the one last built.
#[derive(Clone)]
pub struct NightlyRecorder {
    store: Arc<dyn StateStore>,
}

impl NightlyRecorder {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn observe(&self, project: &str, revision: &str) -> Result<()> {
        self.store
            .update_nightly_stamp(project, StampUpdate::Observed(revision.to_string()))
            .await
            .map(|_| ())
    }

    /// Revision to build, or `None` when nothing new was observed since the
    /// last successful nightly.
    pub async fn pending(&self, project: &str) -> Result<Option<String>> {
        let stamp = self.store.nightly_stamp(project).await?;
        Ok(if stamp.has_new_revision() {
            stamp.observed
        } else {
            None
        })
    }

    pub async fn mark_fired(&self, project: &str, revision: &str) -> Result<()> {
        self.store
            .update_nightly_stamp(project, StampUpdate::Fired(revision.to_string()))
            .await
            .map(|_| ())
    }
}
