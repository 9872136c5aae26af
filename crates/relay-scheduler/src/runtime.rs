//! Pipeline runtime.
//!
//! Fires schedulers, runs the build targets they start through the target
//! state machine and carries properties along trigger edges. Propagation
//! actions and the staleness check are interpreted here; every other stage
//! action goes to the [`StageExecutor`].

use crate::debounce::ChangeFiring;
use crate::graph::TriggerGraph;
use crate::locks::{LockGuard, LockHolder, LockManager};
use crate::nightly::NightlyRecorder;
use crate::staleness::needs_regeneration;
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use relay_core::action::{ActionContext, ActionOutcome, PlannedAction, StageAction};
use relay_core::events::{
    ActionCompletedPayload, ActionStatus, Event, SchedulerFiredPayload, TargetStateChangedPayload,
};
use relay_core::ids::{BuildId, FiringId, SchedulerName};
use relay_core::lock::LockRequest;
use relay_core::ports::{EventSink, StageExecutor, StateStore};
use relay_core::properties::{BRANCH, BuildProperties, GOT_REVISION, PROJECT, REASON, REPOSITORY};
use relay_core::settings::RuntimeSettings;
use relay_core::target::{BuildResult, BuildTarget, TargetReport, TargetState};
use relay_core::trigger::{ForceRequest, SchedulerDef, SchedulerKind};
use relay_core::{Error, Result};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Properties every downstream build inherits from its trigger.
const CARRIED: [&str; 4] = [REPOSITORY, BRANCH, PROJECT, REASON];

/// Outcome of one scheduler firing.
#[derive(Debug, Clone)]
pub struct FiringReport {
    pub firing_id: FiringId,
    pub scheduler: SchedulerName,
    /// Reports of the targets the scheduler started, in scheduler order.
    pub reports: Vec<TargetReport>,
}

impl FiringReport {
    /// Worst result among the started targets; an empty firing succeeds.
    pub fn result(&self) -> BuildResult {
        self.reports
            .iter()
            .map(|r| r.result)
            .fold(BuildResult::Success, BuildResult::worst)
    }

    /// Whether every started target short-circuited.
    pub fn is_noop(&self) -> bool {
        self.reports.iter().all(|r| r.noop)
    }

    /// Search the whole report tree, including fanned-out children.
    pub fn find(&self, target: &str) -> Option<&TargetReport> {
        self.reports.iter().find_map(|r| r.find(target))
    }

    pub fn all(&self) -> Vec<&TargetReport> {
        self.reports.iter().flat_map(|r| r.flatten()).collect()
    }
}

pub struct PipelineRuntime {
    graph: Arc<TriggerGraph>,
    locks: LockManager,
    executor: Arc<dyn StageExecutor>,
    sink: Arc<dyn EventSink>,
    recorder: NightlyRecorder,
}

impl PipelineRuntime {
    pub fn new(
        graph: Arc<TriggerGraph>,
        settings: &RuntimeSettings,
        executor: Arc<dyn StageExecutor>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            graph,
            locks: LockManager::new(settings.caps).with_sink(sink.clone()),
            executor,
            sink,
            recorder: NightlyRecorder::new(store),
        }
    }

    /// Share source-tree locks with other processes through lock files.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.locks = self.locks.with_lock_dir(dir);
        self
    }

    pub fn graph(&self) -> &TriggerGraph {
        &self.graph
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn recorder(&self) -> &NightlyRecorder {
        &self.recorder
    }

    /// Fire a scheduler: start every target it names concurrently and wait
    /// for all of them.
    ///
    /// Only change-triggered and triggerable schedulers take raw properties.
    /// A nightly scheduler goes through its revision gate and ignores them;
    /// a manual one only fires through [`PipelineRuntime::force`].
    pub async fn fire(&self, scheduler: &str, properties: BuildProperties) -> Result<FiringReport> {
        let def = self
            .graph
            .scheduler(scheduler)
            .ok_or_else(|| Error::SchedulerNotFound(scheduler.to_string()))?;
        match &def.kind {
            SchedulerKind::Change { .. } | SchedulerKind::Triggerable => {
                Ok(self.fire_def(def, properties).await)
            }
            SchedulerKind::Nightly { .. } => self.fire_nightly(&def.project).await,
            SchedulerKind::Force { .. } => Err(Error::ForceOnly(scheduler.to_string())),
        }
    }

    async fn fire_def(&self, def: &SchedulerDef, incoming: BuildProperties) -> FiringReport {
        let firing_id = FiringId::new();
        let mut properties = source_properties(def);
        properties.merge(&incoming);

        info!(
            scheduler = %def.name,
            kind = def.kind.label(),
            targets = def.targets.len(),
            firing_id = %firing_id,
            "Scheduler fired"
        );
        self.sink.emit(Event::SchedulerFired(SchedulerFiredPayload {
            firing_id,
            scheduler: def.name.clone(),
            targets: def.targets.clone(),
            fired_at: Utc::now(),
        }));

        let runs = self
            .graph
            .started_by(def.name.as_str())
            .into_iter()
            .map(|target| self.run_target(target, properties.clone()));
        let reports = join_all(runs).await;

        FiringReport {
            firing_id,
            scheduler: def.name.clone(),
            reports,
        }
    }

    /// Fire the change-triggered scheduler a debounced firing belongs to.
    pub async fn on_change(&self, firing: ChangeFiring) -> Result<FiringReport> {
        debug!(
            scheduler = %firing.scheduler,
            changes = firing.changes.len(),
            revision = firing.latest_revision().unwrap_or("-"),
            "Dispatching change firing"
        );
        self.fire(firing.scheduler.as_str(), BuildProperties::new()).await
    }

    /// Run a manual scheduler with operator-supplied flags.
    pub async fn force(&self, scheduler: &str, request: ForceRequest) -> Result<FiringReport> {
        let def = self
            .graph
            .scheduler(scheduler)
            .ok_or_else(|| Error::SchedulerNotFound(scheduler.to_string()))?;
        if !matches!(def.kind, SchedulerKind::Force { .. }) {
            return Err(Error::NotManual(scheduler.to_string()));
        }
        let requested_by = request.requested_by.clone();
        let properties = request.into_properties()?;
        info!(
            scheduler = %def.name,
            requested_by = requested_by.as_deref().unwrap_or("unknown"),
            reason = properties.text(REASON).unwrap_or_default(),
            "Forced build requested"
        );
        Ok(self.fire_def(def, properties).await)
    }

    /// Nightly firing of a project: builds the last observed revision, or
    /// short-circuits when it was already built.
    pub async fn fire_nightly(&self, project: &str) -> Result<FiringReport> {
        let name = SchedulerName::nightly(project);
        let def = self
            .graph
            .scheduler(name.as_str())
            .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))?;

        let Some(revision) = self.recorder.pending(project).await? else {
            info!(scheduler = %def.name, "No new revision since last nightly, skipping");
            let reports = self
                .graph
                .started_by(def.name.as_str())
                .into_iter()
                .map(|target| self.noop_target(target))
                .collect();
            return Ok(FiringReport {
                firing_id: FiringId::new(),
                scheduler: def.name.clone(),
                reports,
            });
        };

        let properties = BuildProperties::new().with(GOT_REVISION, revision.as_str());
        let report = self.fire_def(def, properties).await;
        if report.result().is_success() {
            self.recorder.mark_fired(project, &revision).await?;
        } else {
            warn!(
                scheduler = %def.name,
                revision = %revision,
                "Nightly build failed, revision stays pending"
            );
        }
        Ok(report)
    }

    fn noop_target(&self, target: &BuildTarget) -> TargetReport {
        let build_id = BuildId::new();
        let now = Utc::now();
        let mut tracker = StateTracker::new(self, target, build_id);
        tracker.advance(TargetState::Succeeded);
        tracker.advance(TargetState::Released);
        TargetReport {
            build_id,
            target: target.name.clone(),
            result: BuildResult::Success,
            noop: true,
            failed_action: None,
            reason: None,
            properties: target.properties.clone(),
            children: vec![],
            started_at: now,
            finished_at: now,
        }
    }

    /// Run one target instance through pending, locked, running, a terminal
    /// state and released.
    fn run_target<'a>(
        &'a self,
        target: &'a BuildTarget,
        incoming: BuildProperties,
    ) -> BoxFuture<'a, TargetReport> {
        async move {
            let build_id = BuildId::new();
            let started_at = Utc::now();
            let mut properties = target.properties.clone();
            properties.merge(&incoming);

            let mut tracker = StateTracker::new(self, target, build_id);
            let holder = LockHolder::new(target.name.as_str()).with_build(build_id);

            tracker.advance(TargetState::Locked);
            let target_locks = match self.locks.acquire_all(&holder, &target.locks).await {
                Ok(guards) => guards,
                Err(e) => {
                    error!(target_name = %target.name, error = %e, "Failed to acquire target locks");
                    tracker.advance(TargetState::Failed);
                    tracker.advance(TargetState::Released);
                    return TargetReport {
                        build_id,
                        target: target.name.clone(),
                        result: BuildResult::Failure,
                        noop: false,
                        failed_action: None,
                        reason: Some(e.to_string()),
                        properties,
                        children: vec![],
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
            };

            tracker.advance(TargetState::Running);
            let ctx = ActionContext {
                target: target.name.clone(),
                project: target.project.clone(),
                platform: target.platform.clone(),
                workdir: target.workdir.clone(),
                env: target.env.clone(),
            };

            let mut held: Option<(Vec<LockRequest>, Vec<LockGuard>)> = None;
            let mut children = Vec::new();
            let mut failure: Option<(String, String)> = None;

            for planned in &target.actions {
                if !planned.guard.allows(&properties) {
                    debug!(target_name = %target.name, action = %planned.name, "Skipped");
                    self.action_completed(build_id, target, planned, ActionStatus::Skipped, None);
                    continue;
                }

                // Consecutive actions with the same lock set keep holding it.
                if held.as_ref().map(|(requests, _)| requests) != Some(&planned.locks) {
                    held = None;
                    if !planned.locks.is_empty() {
                        match self.locks.acquire_all(&holder, &planned.locks).await {
                            Ok(guards) => held = Some((planned.locks.clone(), guards)),
                            Err(e) => {
                                failure = Some((planned.name.clone(), e.to_string()));
                                break;
                            }
                        }
                    }
                }

                let outcome = self
                    .perform(planned, &ctx, &mut properties, &mut children)
                    .await;
                match outcome {
                    ActionOutcome::Success => {
                        if planned.quiet_on_success {
                            debug!(target_name = %target.name, action = %planned.name, "Action succeeded");
                        } else {
                            info!(target_name = %target.name, action = %planned.name, "Action succeeded");
                        }
                        self.action_completed(build_id, target, planned, ActionStatus::Success, None);
                    }
                    ActionOutcome::Failure(reason) => {
                        warn!(
                            target_name = %target.name,
                            action = %planned.name,
                            reason = %reason,
                            "Action failed"
                        );
                        self.action_completed(
                            build_id,
                            target,
                            planned,
                            ActionStatus::Failure,
                            Some(reason.clone()),
                        );
                        failure = Some((planned.name.clone(), reason));
                        break;
                    }
                }
            }
            drop(held);

            let result = if failure.is_some() {
                tracker.advance(TargetState::Failed);
                BuildResult::Failure
            } else {
                tracker.advance(TargetState::Succeeded);
                BuildResult::Success
            };
            drop(target_locks);
            tracker.advance(TargetState::Released);

            let (failed_action, reason) = failure.unzip();
            TargetReport {
                build_id,
                target: target.name.clone(),
                result,
                noop: false,
                failed_action,
                reason,
                properties,
                children,
                started_at,
                finished_at: Utc::now(),
            }
        }
        .boxed()
    }

    async fn perform(
        &self,
        planned: &PlannedAction,
        ctx: &ActionContext,
        properties: &mut BuildProperties,
        children: &mut Vec<TargetReport>,
    ) -> ActionOutcome {
        match &planned.action {
            StageAction::SignalNightly { scheduler } => {
                let Some(revision) = properties.revision() else {
                    debug!(scheduler = %scheduler, "No resolved revision to record");
                    return ActionOutcome::Success;
                };
                match self.recorder.observe(&ctx.project, revision).await {
                    Ok(()) => ActionOutcome::Success,
                    Err(e) => ActionOutcome::failure(e.to_string()),
                }
            }
            StageAction::TriggerFanOut {
                scheduler,
                set_properties,
            } => {
                let mut downstream = properties.propagate(set_properties);
                for key in CARRIED {
                    if downstream.get(key).is_none()
                        && let Some(value) = properties.get(key)
                    {
                        downstream.set(key, value.clone());
                    }
                }
                let Some(def) = self.graph.scheduler(scheduler.as_str()) else {
                    return ActionOutcome::failure(format!("unknown scheduler {scheduler}"));
                };
                let report = self.fire_def(def, downstream).await;
                let total = report.reports.len();
                let failed = report
                    .reports
                    .iter()
                    .filter(|r| !r.result.is_success())
                    .count();
                children.extend(report.reports);
                if failed == 0 {
                    ActionOutcome::Success
                } else {
                    ActionOutcome::failure(format!("{failed} of {total} triggered builds failed"))
                }
            }
            StageAction::CheckStaleness {
                source,
                generated,
                property,
            } => {
                match needs_regeneration(source, generated).await {
                    Ok(stale) => {
                        debug!(
                            target_name = %ctx.target,
                            property = %property,
                            stale,
                            "Staleness checked"
                        );
                        properties.set(property.clone(), stale);
                        ActionOutcome::Success
                    }
                    Err(e) => ActionOutcome::failure(format!(
                        "cannot compare {} with {}: {}",
                        generated.display(),
                        source.display(),
                        e
                    )),
                }
            }
            action => {
                let run = self.executor.execute(action, ctx, properties);
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => ActionOutcome::failure("stage executor panicked"),
                }
            }
        }
    }

    fn action_completed(
        &self,
        build_id: BuildId,
        target: &BuildTarget,
        planned: &PlannedAction,
        status: ActionStatus,
        reason: Option<String>,
    ) {
        self.sink.emit(Event::ActionCompleted(ActionCompletedPayload {
            build_id,
            target: target.name.clone(),
            action: planned.name.clone(),
            status,
            reason,
            completed_at: Utc::now(),
        }));
    }
}

/// Properties a scheduler binds to every build it starts, so manual and
/// automatic runs look the same downstream.
fn source_properties(def: &SchedulerDef) -> BuildProperties {
    let props = BuildProperties::new().with(PROJECT, def.project.as_str());
    match &def.kind {
        SchedulerKind::Change {
            repositories,
            branch,
            ..
        } => match repositories.first() {
            Some(repository) => props
                .with(REPOSITORY, repository.as_str())
                .with(BRANCH, branch.as_str()),
            None => props.with(BRANCH, branch.as_str()),
        },
        SchedulerKind::Force {
            repository, branch, ..
        } => props
            .with(REPOSITORY, repository.as_str())
            .with(BRANCH, branch.as_str()),
        SchedulerKind::Nightly { branch, .. } => props.with(BRANCH, branch.as_str()),
        SchedulerKind::Triggerable => props,
    }
}

/// Emits every state transition of one target instance.
struct StateTracker<'a> {
    runtime: &'a PipelineRuntime,
    target: &'a BuildTarget,
    build_id: BuildId,
    state: TargetState,
}

impl<'a> StateTracker<'a> {
    fn new(runtime: &'a PipelineRuntime, target: &'a BuildTarget, build_id: BuildId) -> Self {
        let tracker = Self {
            runtime,
            target,
            build_id,
            state: TargetState::Pending,
        };
        tracker.emit();
        tracker
    }

    fn advance(&mut self, next: TargetState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        match next {
            TargetState::Running | TargetState::Succeeded => {
                info!(target_name = %self.target.name, build_id = %self.build_id, state = ?next, "Target state changed");
            }
            TargetState::Failed => {
                warn!(target_name = %self.target.name, build_id = %self.build_id, "Target failed");
            }
            _ => {
                debug!(target_name = %self.target.name, build_id = %self.build_id, state = ?next, "Target state changed");
            }
        }
        self.emit();
    }

    fn emit(&self) {
        self.runtime
            .sink
            .emit(Event::TargetStateChanged(TargetStateChangedPayload {
                build_id: self.build_id,
                target: self.target.name.clone(),
                worker_class: self.target.worker_class,
                state: self.state,
                at: Utc::now(),
            }));
    }
}
