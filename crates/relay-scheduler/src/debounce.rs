//! Change debouncing for change-triggered schedulers.
//!
//! The first matching change opens a window of `tree_stable_secs`; every
//! change seen before the window closes is coalesced into a single firing.
//! A change arriving after that opens a new window.

use crate::graph::TriggerGraph;
use relay_core::ids::SchedulerName;
use relay_core::ports::{Change, ChangeSource};
use relay_core::trigger::SchedulerKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, warn};

/// Changes coalesced into one firing of a change-triggered scheduler.
#[derive(Debug, Clone)]
pub struct ChangeFiring {
    pub scheduler: SchedulerName,
    pub project: String,
    pub changes: Vec<Change>,
}

impl ChangeFiring {
    /// Most recent revision among the coalesced changes.
    pub fn latest_revision(&self) -> Option<&str> {
        self.changes.last().map(|c| c.revision.as_str())
    }
}

#[derive(Debug)]
struct Watch {
    scheduler: SchedulerName,
    project: String,
    repositories: Vec<String>,
    branch: String,
    window: Duration,
    pending: Vec<Change>,
    deadline: Option<Instant>,
}

impl Watch {
    fn matches(&self, change: &Change) -> bool {
        change.branch == self.branch && self.repositories.iter().any(|r| *r == change.repository)
    }
}

/// Routes changes to the schedulers watching them and releases firings once
/// their window has elapsed.
#[derive(Debug, Default)]
pub struct ChangeDispatcher {
    watches: Vec<Watch>,
}

impl ChangeDispatcher {
    pub fn from_graph(graph: &TriggerGraph) -> Self {
        let watches = graph
            .schedulers()
            .filter_map(|def| match &def.kind {
                SchedulerKind::Change {
                    repositories,
                    branch,
                    tree_stable_secs,
                } => Some(Watch {
                    scheduler: def.name.clone(),
                    project: def.project.clone(),
                    repositories: repositories.clone(),
                    branch: branch.clone(),
                    window: Duration::from_secs(*tree_stable_secs),
                    pending: vec![],
                    deadline: None,
                }),
                _ => None,
            })
            .collect();
        Self { watches }
    }

    /// Record a change; returns false when no scheduler watches it.
    pub fn observe(&mut self, change: Change, now: Instant) -> bool {
        let mut matched = false;
        for watch in self.watches.iter_mut().filter(|w| w.matches(&change)) {
            matched = true;
            let deadline = *watch.deadline.get_or_insert(now + watch.window);
            debug!(
                scheduler = %watch.scheduler,
                revision = %change.revision,
                pending = watch.pending.len() + 1,
                fires_in = ?deadline.saturating_duration_since(now),
                "Change queued"
            );
            watch.pending.push(change.clone());
        }
        matched
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.watches.iter().filter_map(|w| w.deadline).min()
    }

    /// Firings whose window has closed at `now`.
    pub fn due(&mut self, now: Instant) -> Vec<ChangeFiring> {
        let mut firings = Vec::new();
        for watch in &mut self.watches {
            if watch.deadline.is_some_and(|d| d <= now) {
                watch.deadline = None;
                firings.push(ChangeFiring {
                    scheduler: watch.scheduler.clone(),
                    project: watch.project.clone(),
                    changes: std::mem::take(&mut watch.pending),
                });
            }
        }
        firings
    }

    /// Drive the dispatcher until the change channel closes.
    pub async fn run(
        mut self,
        mut changes: mpsc::Receiver<Change>,
        firings: mpsc::Sender<ChangeFiring>,
    ) {
        loop {
            let deadline = self.next_deadline();
            let wake = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                change = changes.recv() => match change {
                    Some(change) => {
                        if !self.observe(change.clone(), Instant::now()) {
                            debug!(
                                repository = %change.repository,
                                branch = %change.branch,
                                "Change matches no scheduler"
                            );
                        }
                    }
                    None => break,
                },
                _ = wake => {
                    for firing in self.due(Instant::now()) {
                        info!(
                            scheduler = %firing.scheduler,
                            changes = firing.changes.len(),
                            "Tree stable, firing"
                        );
                        if firings.send(firing).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!("Change channel closed, dispatcher stopping");
    }
}

/// Poll a change source every `period` and forward what it reports, until
/// the receiving side goes away.
pub async fn poll_changes(
    source: Arc<dyn ChangeSource>,
    period: Duration,
    changes: mpsc::Sender<Change>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.poll().await {
            Ok(observed) => {
                for change in observed {
                    if changes.send(change).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Change poll failed"),
        }
        if changes.is_closed() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use relay_core::platform::PlatformCatalog;
    use relay_core::project::{Project, ProjectSet, SourceRef};
    use relay_core::settings::RuntimeSettings;

    const REPO: &str = "https://example.org/alpha";

    fn dispatcher() -> ChangeDispatcher {
        let catalog = PlatformCatalog::default();
        let projects = ProjectSet::new(vec![Project::new("alpha", SourceRef::new(REPO, "main"))])
            .unwrap();
        let graph = GraphBuilder::new(&catalog, &RuntimeSettings::default())
            .build(&projects)
            .unwrap();
        ChangeDispatcher::from_graph(&graph)
    }

    #[test]
    fn test_burst_coalesces_into_one_firing() {
        let mut dispatcher = dispatcher();
        let start = Instant::now();
        for (i, offset) in [0u64, 10, 120, 299].into_iter().enumerate() {
            let at = start + Duration::from_secs(offset);
            assert!(dispatcher.observe(Change::new(REPO, "main", format!("rev{i}")), at));
            assert!(dispatcher.due(at).is_empty());
        }

        let firings = dispatcher.due(start + Duration::from_secs(300));
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].scheduler, "branch-scheduler-alpha");
        assert_eq!(firings[0].changes.len(), 4);
        assert_eq!(firings[0].latest_revision(), Some("rev3"));
        assert!(dispatcher.next_deadline().is_none());

        let later = start + Duration::from_secs(400);
        dispatcher.observe(Change::new(REPO, "main", "rev4"), later);
        assert!(dispatcher.due(later + Duration::from_secs(299)).is_empty());
        assert_eq!(dispatcher.due(later + Duration::from_secs(300)).len(), 1);
    }

    #[test]
    fn test_change_filter() {
        let mut dispatcher = dispatcher();
        let now = Instant::now();
        assert!(!dispatcher.observe(Change::new(REPO, "develop", "r1"), now));
        assert!(!dispatcher.observe(Change::new("https://example.org/other", "main", "r1"), now));
        assert!(dispatcher.observe(Change::new(format!("{REPO}.git"), "main", "r1"), now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_after_window() {
        let (change_tx, change_rx) = mpsc::channel(16);
        let (firing_tx, mut firing_rx) = mpsc::channel(16);
        let handle = tokio::spawn(dispatcher().run(change_rx, firing_tx));

        let start = Instant::now();
        for i in 0..5 {
            change_tx
                .send(Change::new(REPO, "main", format!("rev{i}")))
                .await
                .unwrap();
        }

        let firing = firing_rx.recv().await.unwrap();
        assert_eq!(firing.changes.len(), 5);
        assert!(start.elapsed() >= Duration::from_secs(300));
        assert!(firing_rx.try_recv().is_err());

        change_tx.send(Change::new(REPO, "main", "rev5")).await.unwrap();
        let second = firing_rx.recv().await.unwrap();
        assert_eq!(second.latest_revision(), Some("rev5"));

        drop(change_tx);
        handle.await.unwrap();
    }

    struct Scripted {
        polls: std::sync::Mutex<Vec<relay_core::Result<Vec<Change>>>>,
    }

    #[async_trait::async_trait]
    impl ChangeSource for Scripted {
        async fn poll(&self) -> relay_core::Result<Vec<Change>> {
            self.polls.lock().unwrap().pop().unwrap_or(Ok(vec![]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_changes_survives_errors() {
        // Popped from the back.
        let source = Arc::new(Scripted {
            polls: std::sync::Mutex::new(vec![
                Ok(vec![Change::new(REPO, "main", "r2")]),
                Err(relay_core::Error::Internal("ls-remote failed".to_string())),
                Ok(vec![Change::new(REPO, "main", "r1")]),
            ]),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(poll_changes(source, Duration::from_secs(60), tx));

        assert_eq!(rx.recv().await.unwrap().revision, "r1");
        let start = Instant::now();
        assert_eq!(rx.recv().await.unwrap().revision, "r2");
        assert!(start.elapsed() >= Duration::from_secs(120));

        drop(rx);
        handle.await.unwrap();
    }
}
