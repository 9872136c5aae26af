//! Command handlers.

use crate::commands::{ForceWhat, OutputFormat};
use crate::config::{self, MAX_JOBS_ENV, RelayConfig, ResolvedConfig};
use crate::poller::GitPoller;
use crate::shell::ShellExecutor;
use anyhow::{Context, Result, bail};
use chrono::Local;
use console::style;
use relay_core::ids::SchedulerName;
use relay_core::ports::{EventSink, StageExecutor, StateStore};
use relay_core::project::{NightlySchedule, Project};
use relay_core::target::{BuildResult, BuildTarget, TargetReport};
use relay_core::trigger::{ForceRequest, SchedulerDef};
use relay_scheduler::nightly::next_fire;
use relay_scheduler::{
    ChangeDispatcher, DryRunExecutor, FileStateStore, FiringReport, GraphBuilder,
    MemoryStateStore, PipelineRuntime, TracingSink, TriggerGraph, poll_changes,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

fn load(path: &Path) -> Result<(ResolvedConfig, TriggerGraph)> {
    let resolved = RelayConfig::from_file(path)?
        .resolve(std::env::var(MAX_JOBS_ENV).ok().as_deref())
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    let graph = GraphBuilder::new(&resolved.catalog, &resolved.settings)
        .build(&resolved.projects)
        .context("Failed to build trigger graph")?;
    Ok((resolved, graph))
}

struct Backends {
    executor: Arc<dyn StageExecutor>,
    store: Arc<dyn StateStore>,
    /// Shared with every other relay process on this data directory.
    lock_dir: Option<PathBuf>,
}

/// Dry runs log actions, keep state in memory and never touch the trees,
/// so they skip the lock files too.
fn backends(resolved: &ResolvedConfig, dry_run: bool) -> Result<Backends> {
    if dry_run {
        Ok(Backends {
            executor: Arc::new(DryRunExecutor),
            store: Arc::new(MemoryStateStore::new()),
            lock_dir: None,
        })
    } else {
        config::prepare_dirs(&resolved.settings.layout).with_context(|| {
            format!(
                "Failed to create data directories under {}",
                resolved.settings.layout.data_dir.display()
            )
        })?;
        Ok(Backends {
            executor: Arc::new(ShellExecutor::new()),
            store: Arc::new(FileStateStore::new(resolved.settings.layout.clone())),
            lock_dir: Some(resolved.settings.layout.lock_dir()),
        })
    }
}

fn runtime(resolved: &ResolvedConfig, graph: TriggerGraph, backends: Backends) -> PipelineRuntime {
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let runtime = PipelineRuntime::new(
        Arc::new(graph),
        &resolved.settings,
        backends.executor,
        sink,
        backends.store,
    );
    match backends.lock_dir {
        Some(dir) => runtime.with_lock_dir(dir),
        None => runtime,
    }
}

pub fn validate(path: &Path) -> Result<()> {
    let (resolved, graph) = load(path)?;

    println!(
        "{} Configuration {} is valid",
        style("✓").green(),
        style(path.display()).bold()
    );
    println!("  Projects:   {}", resolved.projects.len());
    println!("  Platforms:  {}", resolved.catalog.len());
    println!("  Schedulers: {}", graph.schedulers().count());
    println!("  Targets:    {}", graph.targets().count());
    println!("  Max jobs:   {}", resolved.settings.max_jobs);
    for project in resolved.projects.iter() {
        let platforms: Vec<&str> = resolved
            .catalog
            .eligible(project)
            .into_iter()
            .map(|p| p.name())
            .collect();
        println!(
            "    - {} ({} platforms, {} schedulers){}",
            project.name,
            platforms.len(),
            graph.schedulers_for(&project.name).len(),
            nightly_suffix(project)
        );
    }
    Ok(())
}

fn nightly_suffix(project: &Project) -> String {
    project
        .nightly
        .map(|NightlySchedule { hour, minute }| format!(", nightly at {hour:02}:{minute:02}"))
        .unwrap_or_default()
}

#[derive(Serialize)]
struct GraphDocument<'a> {
    schedulers: Vec<&'a SchedulerDef>,
    targets: Vec<&'a BuildTarget>,
}

pub fn graph(path: &Path, format: OutputFormat) -> Result<()> {
    let (_, graph) = load(path)?;
    let document = GraphDocument {
        schedulers: graph.schedulers().collect(),
        targets: graph.targets().collect(),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&document)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&document)?),
        OutputFormat::Table => {
            println!("{}", style("Schedulers").bold());
            for def in &document.schedulers {
                let targets: Vec<&str> = def.targets.iter().map(|t| t.as_str()).collect();
                println!(
                    "  {:<36} {:<12} {:<5} -> {}",
                    def.name.as_str(),
                    def.kind.label(),
                    if def.wait_for_finish { "wait" } else { "" },
                    targets.join(", ")
                );
            }
            println!();
            println!("{}", style("Targets").bold());
            for target in &document.targets {
                let locks: Vec<String> = target.locks.iter().map(|l| l.to_string()).collect();
                println!(
                    "  {:<36} {:<8} [{}]",
                    target.name.as_str(),
                    target.worker_class.to_string(),
                    locks.join(", ")
                );
                let actions: Vec<&str> = target.actions.iter().map(|a| a.name.as_str()).collect();
                println!("      {}", style(actions.join(" → ")).dim());
            }
        }
    }
    Ok(())
}

pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(RelayConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

pub struct ForceArgs {
    pub project: String,
    pub what: ForceWhat,
    pub reason: String,
    pub clean: bool,
    pub package: bool,
    pub dry_run: bool,
}

pub async fn force(path: &Path, args: ForceArgs) -> Result<()> {
    let (resolved, graph) = load(path)?;
    let scheduler = match args.what {
        ForceWhat::Fetch => SchedulerName::force_fetch(&args.project),
        ForceWhat::Build => SchedulerName::force_build(&args.project),
    };
    let runtime = runtime(&resolved, graph, backends(&resolved, args.dry_run)?);

    println!(
        "{} Forcing {} ({})",
        style("▶").cyan(),
        style(&scheduler).bold(),
        style(&args.reason).dim()
    );
    let mut request = ForceRequest::new(args.reason)
        .clean(args.clean)
        .package(args.package);
    request.requested_by = std::env::var("USER").ok();

    let report = runtime.force(scheduler.as_str(), request).await?;
    print_firing(&report);
    if report.result() != BuildResult::Success {
        bail!("{} finished with failures", scheduler);
    }
    Ok(())
}

fn print_firing(report: &FiringReport) {
    if report.reports.is_empty() {
        println!("{} {} started no targets", style("i").blue(), report.scheduler);
    }
    for target in &report.reports {
        print_target(target, 1);
    }
}

fn print_target(report: &TargetReport, depth: usize) {
    let indent = "  ".repeat(depth);
    let marker = match report.result {
        BuildResult::Success => style("✓").green(),
        BuildResult::Failure => style("✗").red(),
    };
    let mut line = format!("{indent}{marker} {}", report.target);
    if report.noop {
        line.push_str(" (nothing to do)");
    }
    if let Some(action) = &report.failed_action {
        line.push_str(&format!(" [{action}]"));
    }
    if let Some(reason) = &report.reason {
        line.push_str(&format!(": {reason}"));
    }
    println!("{line}");
    for child in &report.children {
        print_target(child, depth + 1);
    }
}

pub async fn serve(path: &Path, dry_run: bool) -> Result<()> {
    let (resolved, graph) = load(path)?;
    let dispatcher = ChangeDispatcher::from_graph(&graph);
    let backends = backends(&resolved, dry_run)?;
    let store = backends.store.clone();
    let runtime = Arc::new(runtime(&resolved, graph, backends));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let (change_tx, change_rx) = mpsc::channel(64);
    let (firing_tx, mut firing_rx) = mpsc::channel(16);

    for project in resolved.projects.iter() {
        let poller = Arc::new(GitPoller::new(project, store.clone()));
        tasks.push(tokio::spawn(poll_changes(
            poller,
            resolved.settings.poll_interval,
            change_tx.clone(),
        )));
    }
    drop(change_tx);
    tasks.push(tokio::spawn(dispatcher.run(change_rx, firing_tx)));

    let firing_runtime = runtime.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(firing) = firing_rx.recv().await {
            let runtime = firing_runtime.clone();
            tokio::spawn(async move {
                let scheduler = firing.scheduler.clone();
                match runtime.on_change(firing).await {
                    Ok(report) => log_firing(&report),
                    Err(e) => error!(scheduler = %scheduler, error = %e, "Firing failed"),
                }
            });
        }
    }));

    for project in resolved.projects.iter() {
        if let Some(schedule) = project.nightly {
            tasks.push(tokio::spawn(nightly_timer(
                runtime.clone(),
                project.name.clone(),
                schedule,
            )));
        }
    }

    info!(
        projects = resolved.projects.len(),
        platforms = resolved.catalog.len(),
        dry_run,
        "Relay serving"
    );
    println!(
        "{} Serving {} projects (Ctrl+C to stop)",
        style("▶").cyan(),
        resolved.projects.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn nightly_timer(runtime: Arc<PipelineRuntime>, project: String, schedule: NightlySchedule) {
    loop {
        let now = Local::now();
        let next = match next_fire(&schedule, &now) {
            Ok(next) => next,
            Err(e) => {
                error!(project = %project, error = %e, "Nightly timer stopped");
                return;
            }
        };
        info!(project = %project, at = %next, "Next nightly");
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match runtime.fire_nightly(&project).await {
            Ok(report) => log_firing(&report),
            Err(e) => warn!(project = %project, error = %e, "Nightly firing failed"),
        }
    }
}

fn log_firing(report: &FiringReport) {
    match report.result() {
        BuildResult::Success => info!(
            scheduler = %report.scheduler,
            targets = report.reports.len(),
            noop = report.is_noop(),
            "Firing finished"
        ),
        BuildResult::Failure => warn!(
            scheduler = %report.scheduler,
            failed = report.all().iter().filter(|r| !r.result.is_success()).count(),
            "Firing finished with failures"
        ),
    }
}
