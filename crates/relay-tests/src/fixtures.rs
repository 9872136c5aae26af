//! Test fixtures for projects, platforms and assembled pipelines.

use crate::helpers::ScriptedExecutor;
use relay_core::platform::{Platform, PlatformCatalog, ProjectFilter, StaticPlatform};
use relay_core::project::{NightlySchedule, Project, ProjectSet, SourceRef};
use relay_core::settings::{Layout, RuntimeSettings, WorkerCaps};
use relay_scheduler::{
    FanoutSink, GraphBuilder, MemoryStateStore, PipelineRuntime, RecordingSink, TracingSink,
    TriggerGraph,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Factory for test projects.
pub struct ProjectFixture;

impl ProjectFixture {
    pub const ALPHA_URL: &'static str = "https://github.com/example/alpha";

    /// Nightly at 04:01, one patch, tests enabled.
    pub fn alpha() -> Project {
        Project::new("alpha", SourceRef::new(Self::ALPHA_URL, "main"))
            .with_nightly(NightlySchedule { hour: 4, minute: 1 })
            .with_description("Alpha latest")
            .with_patches(vec!["alpha-no-lto.patch".to_string()])
            .with_data_files(vec!["README".to_string()])
    }

    /// No schedule, no patches.
    pub fn tools() -> Project {
        Project::new("tools", SourceRef::new("https://github.com/example/tools", "master"))
    }

    /// Like [`ProjectFixture::tools`] but without manual triggering.
    pub fn locked_down(name: &str) -> Project {
        Project::new(name, SourceRef::new(format!("https://example.org/{name}"), "main"))
            .with_force(false)
    }
}

/// Factory for test platforms.
pub struct PlatformFixture;

impl PlatformFixture {
    /// Native platform: runs tests, packages everything.
    pub fn linux() -> StaticPlatform {
        let mut platform = StaticPlatform::new("linux", "relay/linux:latest");
        platform.configure_args = vec!["--enable-release".to_string()];
        platform.strip_cmd = Some(relay_core::platform::CommandSpec::new(["strip", "alpha"]));
        platform.built_files = vec!["alpha".to_string()];
        platform
    }

    /// Cross-compiling platform: builds the test runner but cannot run it.
    pub fn windows() -> StaticPlatform {
        let mut platform = StaticPlatform::new("windows", "relay/mingw:latest");
        platform.archive_ext = "zip".to_string();
        platform.run_tests = ProjectFilter::none();
        platform.built_files = vec!["alpha.exe".to_string()];
        platform
    }

    /// Plain platform named `name`.
    pub fn named(name: &str) -> StaticPlatform {
        StaticPlatform::new(name, format!("relay/{name}:latest"))
    }
}

/// A complete pipeline wired to a scripted executor and recording sink.
pub struct TestPipeline {
    pub runtime: Arc<PipelineRuntime>,
    pub graph: Arc<TriggerGraph>,
    pub executor: Arc<ScriptedExecutor>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<MemoryStateStore>,
    pub settings: RuntimeSettings,
    pub dir: TempDir,
}

impl TestPipeline {
    pub fn builder() -> TestPipelineBuilder {
        TestPipelineBuilder::default()
    }

    /// A second runtime over the same graph, data directory, executor and
    /// event log, standing in for another relay process on the same host.
    pub fn peer_runtime(&self) -> PipelineRuntime {
        PipelineRuntime::new(
            self.graph.clone(),
            &self.settings,
            self.executor.clone(),
            self.sink.clone(),
            self.store.clone(),
        )
        .with_lock_dir(self.settings.layout.lock_dir())
    }
}

#[derive(Default)]
pub struct TestPipelineBuilder {
    projects: Vec<Project>,
    platforms: Vec<StaticPlatform>,
    max_parallel_builds: Option<u32>,
    tree_stable: Option<Duration>,
    executor: Option<ScriptedExecutor>,
    shared_locks: bool,
}

impl TestPipelineBuilder {
    pub fn project(mut self, project: Project) -> Self {
        self.projects.push(project);
        self
    }

    pub fn platform(mut self, platform: StaticPlatform) -> Self {
        self.platforms.push(platform);
        self
    }

    pub fn max_parallel_builds(mut self, cap: u32) -> Self {
        self.max_parallel_builds = Some(cap);
        self
    }

    pub fn tree_stable(mut self, window: Duration) -> Self {
        self.tree_stable = Some(window);
        self
    }

    pub fn executor(mut self, executor: ScriptedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Back source-tree locks with lock files under the data directory.
    pub fn shared_locks(mut self) -> Self {
        self.shared_locks = true;
        self
    }

    /// Panics on invalid fixtures; only meant for tests.
    pub fn build(self) -> TestPipeline {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = RuntimeSettings {
            max_jobs: 4,
            caps: WorkerCaps::new(self.max_parallel_builds.unwrap_or(1)),
            tree_stable: self.tree_stable.unwrap_or(Duration::from_secs(300)),
            poll_interval: Duration::from_secs(60),
            layout: Layout {
                data_dir: dir.path().join("data"),
                configuration_dir: dir.path().join("config"),
                snapshots_dir: dir.path().join("snapshots"),
                snapshots_url: "https://downloads.example.org/snapshots".to_string(),
            },
        };

        let catalog = PlatformCatalog::new(
            self.platforms
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn Platform>)
                .collect(),
        )
        .expect("Invalid platform fixtures");
        let projects = ProjectSet::new(self.projects).expect("Invalid project fixtures");
        let graph = Arc::new(
            GraphBuilder::new(&catalog, &settings)
                .build(&projects)
                .expect("Failed to build trigger graph"),
        );

        let executor = Arc::new(self.executor.unwrap_or_default());
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStateStore::new());
        let events = FanoutSink::new()
            .with(sink.clone())
            .with(Arc::new(TracingSink));
        let mut runtime = PipelineRuntime::new(
            graph.clone(),
            &settings,
            executor.clone(),
            Arc::new(events),
            store.clone(),
        );
        if self.shared_locks {
            runtime = runtime.with_lock_dir(settings.layout.lock_dir());
        }
        let runtime = Arc::new(runtime);

        TestPipeline {
            runtime,
            graph,
            executor,
            sink,
            store,
            settings,
            dir,
        }
    }
}
