//! Trigger graph: schedulers and build targets joined by start/trigger edges.
//!
//! The graph is built once at startup and validated (unique names, resolved
//! references, no cycles) before anything is scheduled.

use crate::assembler::PipelineAssembler;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use relay_core::ids::{SchedulerName, TargetName};
use relay_core::platform::PlatformCatalog;
use relay_core::project::{Project, ProjectSet};
use relay_core::settings::RuntimeSettings;
use relay_core::target::BuildTarget;
use relay_core::trigger::{ForceParameter, SchedulerDef, SchedulerKind};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Duplicate node name: {0}")]
    DuplicateName(String),
    #[error("Unknown scheduler {scheduler} triggered by {target}")]
    UnknownScheduler { target: String, scheduler: String },
    #[error("Unknown target {target} started by {scheduler}")]
    UnknownTarget { scheduler: String, target: String },
    #[error("Cycle detected in trigger graph at {0}")]
    CycleDetected(String),
}

impl From<GraphError> for relay_core::Error {
    fn from(err: GraphError) -> Self {
        relay_core::Error::InvalidGraph(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum GraphNode {
    Scheduler(SchedulerDef),
    Target(BuildTarget),
}

impl GraphNode {
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Scheduler(s) => s.name.as_str(),
            GraphNode::Target(t) => t.name.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Scheduler starts a target.
    Starts,
    /// A target's propagation action fires a scheduler.
    Triggers { wait: bool },
}

#[derive(Debug)]
pub struct TriggerGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    index: HashMap<String, NodeIndex>,
}

impl TriggerGraph {
    /// Assemble and validate a graph from explicit node lists.
    pub fn from_parts(
        schedulers: Vec<SchedulerDef>,
        targets: Vec<BuildTarget>,
    ) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        let nodes = schedulers
            .into_iter()
            .map(GraphNode::Scheduler)
            .chain(targets.into_iter().map(GraphNode::Target));
        for node in nodes {
            let name = node.name().to_string();
            if index.contains_key(&name) {
                return Err(GraphError::DuplicateName(name));
            }
            let idx = graph.add_node(node);
            index.insert(name, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            match &graph[idx] {
                GraphNode::Scheduler(def) => {
                    for target in &def.targets {
                        let to = match index.get(target.as_str()) {
                            Some(&to) if matches!(graph[to], GraphNode::Target(_)) => to,
                            _ => {
                                return Err(GraphError::UnknownTarget {
                                    scheduler: def.name.to_string(),
                                    target: target.to_string(),
                                });
                            }
                        };
                        edges.push((idx, to, EdgeKind::Starts));
                    }
                }
                GraphNode::Target(target) => {
                    for planned in &target.actions {
                        let Some((scheduler, wait)) = planned.action.triggered_scheduler() else {
                            continue;
                        };
                        let to = match index.get(scheduler.as_str()) {
                            Some(&to) if matches!(graph[to], GraphNode::Scheduler(_)) => to,
                            _ => {
                                return Err(GraphError::UnknownScheduler {
                                    target: target.name.to_string(),
                                    scheduler: scheduler.to_string(),
                                });
                            }
                        };
                        edges.push((idx, to, EdgeKind::Triggers { wait }));
                    }
                }
            }
        }
        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }

        let trigger_graph = Self { graph, index };
        trigger_graph.topological_order()?;
        Ok(trigger_graph)
    }

    pub fn scheduler(&self, name: &str) -> Option<&SchedulerDef> {
        match self.node(name)? {
            GraphNode::Scheduler(def) => Some(def),
            GraphNode::Target(_) => None,
        }
    }

    pub fn target(&self, name: &str) -> Option<&BuildTarget> {
        match self.node(name)? {
            GraphNode::Target(target) => Some(target),
            GraphNode::Scheduler(_) => None,
        }
    }

    fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&idx| &self.graph[idx])
    }

    /// Schedulers in declaration order.
    pub fn schedulers(&self) -> impl Iterator<Item = &SchedulerDef> {
        self.graph.node_weights().filter_map(|node| match node {
            GraphNode::Scheduler(def) => Some(def),
            GraphNode::Target(_) => None,
        })
    }

    /// Targets in declaration order.
    pub fn targets(&self) -> impl Iterator<Item = &BuildTarget> {
        self.graph.node_weights().filter_map(|node| match node {
            GraphNode::Target(target) => Some(target),
            GraphNode::Scheduler(_) => None,
        })
    }

    /// Targets a scheduler starts, in the scheduler's own order.
    pub fn started_by(&self, scheduler: &str) -> Vec<&BuildTarget> {
        self.scheduler(scheduler)
            .map(|def| {
                def.targets
                    .iter()
                    .filter_map(|name| self.target(name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Targets whose propagation actions fire the given scheduler.
    pub fn triggered_from(&self, scheduler: &str) -> Vec<&BuildTarget> {
        let Some(&idx) = self.index.get(scheduler) else {
            return vec![];
        };
        let mut sources: Vec<_> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        sources.sort();
        sources.dedup();
        sources
            .into_iter()
            .filter_map(|n| match &self.graph[n] {
                GraphNode::Target(target) => Some(target),
                GraphNode::Scheduler(_) => None,
            })
            .collect()
    }

    pub fn schedulers_for(&self, project: &str) -> Vec<&SchedulerDef> {
        self.schedulers().filter(|s| s.project == project).collect()
    }

    pub fn targets_for(&self, project: &str) -> Vec<&BuildTarget> {
        self.targets().filter(|t| t.project == project).collect()
    }

    pub fn topological_order(&self) -> Result<Vec<&GraphNode>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| indices.into_iter().map(|idx| &self.graph[idx]).collect())
            .map_err(|cycle| GraphError::CycleDetected(self.graph[cycle.node_id()].name().to_string()))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Expands projects and the platform catalog into the full topology.
pub struct GraphBuilder<'a> {
    catalog: &'a PlatformCatalog,
    assembler: PipelineAssembler,
    tree_stable: Duration,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(catalog: &'a PlatformCatalog, settings: &RuntimeSettings) -> Self {
        Self {
            catalog,
            assembler: PipelineAssembler::new(settings),
            tree_stable: settings.tree_stable,
        }
    }

    pub fn build(&self, projects: &ProjectSet) -> relay_core::Result<TriggerGraph> {
        self.catalog.check_references(projects)?;

        let mut schedulers = Vec::new();
        let mut targets = Vec::new();
        for project in projects.iter() {
            let (s, t) = self.project_parts(project);
            schedulers.extend(s);
            targets.extend(t);
        }

        let graph = TriggerGraph::from_parts(schedulers, targets)?;
        tracing::info!(
            projects = projects.len(),
            platforms = self.catalog.len(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Trigger graph built"
        );
        Ok(graph)
    }

    /// Schedulers and targets contributed by one project.
    pub fn project_parts(&self, project: &Project) -> (Vec<SchedulerDef>, Vec<BuildTarget>) {
        let name = project.name.as_str();
        let fetch = self.assembler.fetch_target(project);
        let platform_targets: Vec<BuildTarget> = self
            .catalog
            .eligible(project)
            .into_iter()
            .filter_map(|platform| self.assembler.platform_target(project, platform.as_ref()))
            .collect();
        let fan_out: Vec<TargetName> = platform_targets.iter().map(|t| t.name.clone()).collect();

        let mut schedulers = vec![SchedulerDef {
            name: SchedulerName::branch(name),
            project: name.to_string(),
            kind: SchedulerKind::Change {
                repositories: project.source.aliases(),
                branch: project.source.branch.clone(),
                tree_stable_secs: self.tree_stable.as_secs(),
            },
            targets: vec![fetch.name.clone()],
            wait_for_finish: false,
        }];
        let mut targets = vec![fetch];

        if let (Some(schedule), Some(nightly)) =
            (project.nightly, self.assembler.nightly_target(project))
        {
            schedulers.push(SchedulerDef {
                name: SchedulerName::nightly(name),
                project: name.to_string(),
                kind: SchedulerKind::Nightly {
                    branch: project.source.branch.clone(),
                    hour: schedule.hour,
                    minute: schedule.minute,
                    only_if_changed: true,
                },
                targets: vec![nightly.name.clone()],
                wait_for_finish: false,
            });
            targets.push(nightly);
        }

        schedulers.push(SchedulerDef {
            name: SchedulerName::build(name),
            project: name.to_string(),
            kind: SchedulerKind::Triggerable,
            targets: fan_out.clone(),
            wait_for_finish: true,
        });

        if project.enable_force {
            let force = SchedulerKind::Force {
                repository: project.source.base_url.clone(),
                branch: project.source.branch.clone(),
                parameters: ForceParameter::standard(),
            };
            schedulers.push(SchedulerDef {
                name: SchedulerName::force_fetch(name),
                project: name.to_string(),
                kind: force.clone(),
                targets: vec![TargetName::fetch(name)],
                wait_for_finish: false,
            });
            schedulers.push(SchedulerDef {
                name: SchedulerName::force_build(name),
                project: name.to_string(),
                kind: force,
                targets: fan_out,
                wait_for_finish: false,
            });
        }

        targets.extend(platform_targets);
        (schedulers, targets)
    }
}
