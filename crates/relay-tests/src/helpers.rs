//! Scripted stage executor and event analysis.

use async_trait::async_trait;
use relay_core::action::{ActionContext, ActionOutcome, StageAction};
use relay_core::events::Event;
use relay_core::lock::{LockMode, LockScope, WorkerClass};
use relay_core::ports::StageExecutor;
use relay_core::properties::{BuildProperties, GOT_REVISION};
use relay_core::target::TargetState;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// File the scripted configure step writes into the build directory.
pub const CONFIG_MK: &str = "config.mk";

/// One action the scripted executor was asked to run.
#[derive(Debug, Clone)]
pub struct ExecutedAction {
    pub target: String,
    pub action: String,
    pub properties: BuildProperties,
}

/// Stage executor that behaves like a tiny build system.
///
/// Source updates resolve revisions from a queue and create the configure
/// script, configure writes `config.mk`, everything else only sleeps for
/// the configured delay. Failures are scripted per target and action label.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<ExecutedAction>>,
    revisions: Mutex<VecDeque<String>>,
    delays: HashMap<String, Duration>,
    failures: Vec<(String, String)>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revisions handed out by successive source updates; `rev-N` afterwards.
    pub fn with_revisions(self, revisions: &[&str]) -> Self {
        if let Ok(mut queue) = self.revisions.lock() {
            queue.extend(revisions.iter().map(|r| r.to_string()));
        }
        self
    }

    /// Sleep for `delay` whenever an action with this label runs.
    pub fn with_delay(mut self, action: &str, delay: Duration) -> Self {
        self.delays.insert(action.to_string(), delay);
        self
    }

    pub fn failing(mut self, target: &str, action: &str) -> Self {
        self.failures.push((target.to_string(), action.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<ExecutedAction> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Action labels run for one target, in order, across every instance.
    pub fn ran(&self, target: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.target == target)
            .map(|c| c.action)
            .collect()
    }

    fn next_revision(&self) -> String {
        let Ok(mut queue) = self.revisions.lock() else {
            return "rev-0".to_string();
        };
        queue.pop_front().unwrap_or_else(|| {
            let fetched = self.calls().iter().filter(|c| c.action == "update-source").count();
            format!("rev-{}", fetched + 1)
        })
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        action: &StageAction,
        ctx: &ActionContext,
        properties: &mut BuildProperties,
    ) -> ActionOutcome {
        let label = action.label().to_string();
        if let Some(delay) = self.delays.get(&label) {
            tokio::time::sleep(*delay).await;
        }

        let side_effect = match action {
            StageAction::UpdateSource { .. } => {
                if properties.revision().is_none() {
                    properties.set(GOT_REVISION, self.next_revision());
                }
                touch_if_missing(&ctx.workdir.join("configure"))
            }
            StageAction::Configure { .. } => touch(&ctx.workdir.join(CONFIG_MK)),
            StageAction::Clean => match std::fs::remove_dir_all(&ctx.workdir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            _ => Ok(()),
        };

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ExecutedAction {
                target: ctx.target.to_string(),
                action: label.clone(),
                properties: properties.clone(),
            });
        }

        if let Err(e) = side_effect {
            return ActionOutcome::failure(e.to_string());
        }
        if self
            .failures
            .iter()
            .any(|(t, a)| *t == ctx.target.as_str() && *a == label)
        {
            return ActionOutcome::failure("exit status 2");
        }
        ActionOutcome::Success
    }
}

fn touch(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"generated\n")
}

fn touch_if_missing(path: &std::path::Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    touch(path)
}

/// Checks, in emission order, that no exclusive hold of a project's source
/// tree overlaps any other hold of it. Returns the number of exclusive and
/// counting acquisitions seen.
pub fn assert_source_exclusion(events: &[Event], project: &str) -> (usize, usize) {
    let scope = LockScope::source(project);
    let mut exclusive_held = 0u32;
    let mut counting_held = 0u32;
    let mut exclusive_seen = 0;
    let mut counting_seen = 0;

    for event in events {
        match event {
            Event::LockAcquired(p) if p.scope == scope => match p.mode {
                LockMode::Exclusive => {
                    assert_eq!(
                        (exclusive_held, counting_held),
                        (0, 0),
                        "{} took src-{project} exclusively while it was held",
                        p.holder
                    );
                    exclusive_held += 1;
                    exclusive_seen += 1;
                }
                LockMode::Counting => {
                    assert_eq!(
                        exclusive_held, 0,
                        "{} read src-{project} during an exclusive hold",
                        p.holder
                    );
                    counting_held += 1;
                    counting_seen += 1;
                }
            },
            Event::LockReleased(p) if p.scope == scope => match p.mode {
                LockMode::Exclusive => exclusive_held -= 1,
                LockMode::Counting => counting_held -= 1,
            },
            _ => {}
        }
    }
    (exclusive_seen, counting_seen)
}

/// Highest number of simultaneous holders of a worker class.
pub fn peak_holders(events: &[Event], class: WorkerClass) -> u32 {
    let scope = LockScope::Worker(class);
    let mut held = 0u32;
    let mut peak = 0u32;
    for event in events {
        match event {
            Event::LockAcquired(p) if p.scope == scope => {
                held += 1;
                peak = peak.max(held);
            }
            Event::LockReleased(p) if p.scope == scope => held -= 1,
            _ => {}
        }
    }
    peak
}

/// States reported for every instance of `target`, in emission order.
pub fn state_sequence(events: &[Event], target: &str) -> Vec<TargetState> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::TargetStateChanged(p) if p.target == target => Some(p.state),
            _ => None,
        })
        .collect()
}

/// Names of the schedulers fired, in emission order.
pub fn fired_schedulers(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::SchedulerFired(p) => Some(p.scheduler.to_string()),
            _ => None,
        })
        .collect()
}
