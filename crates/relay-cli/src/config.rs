//! Configuration file loading.
//!
//! The file is read once at startup and resolved into immutable values: the
//! project set, the platform catalog and the [`RuntimeSettings`] handed to the
//! scheduler. Nothing reads the file or the environment after that.

use relay_core::platform::{Platform, PlatformCatalog, StaticPlatform};
use relay_core::project::{NightlySchedule, Project, ProjectSet, SourceRef};
use relay_core::settings::{Layout, RuntimeSettings, WorkerCaps};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `max_jobs`.
pub const MAX_JOBS_ENV: &str = "RELAY_MAX_JOBS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid URL {url} for {owner}: {message}")]
    InvalidUrl {
        owner: String,
        url: String,
        message: String,
    },

    #[error("Invalid {MAX_JOBS_ENV} value {0:?}: expected a positive integer")]
    InvalidMaxJobs(String),

    #[error("max_jobs must be at least 1")]
    ZeroMaxJobs,

    #[error(transparent)]
    Model(#[from] relay_core::Error),
}

/// Root of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelayConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base directory of patch files.
    #[serde(default = "default_configuration_dir")]
    pub configuration_dir: PathBuf,
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,
    #[serde(default = "default_snapshots_url")]
    pub snapshots_url: String,
    /// Compiler jobs per build; CPU count plus one when unset.
    #[serde(default)]
    pub max_jobs: Option<u32>,
    /// Cap of the builder worker class.
    #[serde(default = "default_max_parallel_builds")]
    pub max_parallel_builds: u32,
    #[serde(default = "default_tree_stable_secs")]
    pub tree_stable_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default)]
    pub platforms: Vec<StaticPlatform>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_configuration_dir() -> PathBuf {
    PathBuf::from("/etc/relay")
}

fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("/data/snapshots")
}

fn default_snapshots_url() -> String {
    "http://localhost/snapshots".to_string()
}

fn default_max_parallel_builds() -> u32 {
    1
}

fn default_tree_stable_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    /// Canonical repository location.
    pub base_url: String,
    /// Clone URL; `{base_url}.git` when unset.
    #[serde(default)]
    pub git_url: Option<String>,
    pub branch: String,
    /// Nightly time as `[hour, minute]`.
    #[serde(default)]
    pub nightly: Option<[u8; 2]>,
    #[serde(default = "default_true")]
    pub enable_force: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default)]
    pub data_files: Vec<String>,
    #[serde(default)]
    pub configure_flags: Vec<String>,
    #[serde(default)]
    pub verbose_build: bool,
    #[serde(default = "default_true")]
    pub tests: bool,
}

impl ProjectConfig {
    fn into_project(self) -> Result<Project, ConfigError> {
        validate_url(&self.name, &self.base_url)?;

        let mut source = SourceRef::new(&self.base_url, &self.branch);
        if let Some(git_url) = self.git_url {
            source = source.with_git_url(git_url);
        }

        let mut project = Project::new(&self.name, source)
            .with_force(self.enable_force)
            .with_patches(self.patches)
            .with_data_files(self.data_files)
            .with_configure_flags(self.configure_flags)
            .with_verbose_build(self.verbose_build)
            .with_tests(self.tests);
        if let Some([hour, minute]) = self.nightly {
            project = project.with_nightly(NightlySchedule::new(hour, minute)?);
        }
        if let Some(description) = self.description {
            project = project.with_description(description);
        }
        Ok(project)
    }
}

fn validate_url(owner: &str, raw: &str) -> Result<(), ConfigError> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidUrl {
            owner: owner.to_string(),
            url: raw.to_string(),
            message: e.to_string(),
        })
}

/// Everything the scheduler needs, resolved from one configuration file.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: RuntimeSettings,
    pub projects: ProjectSet,
    pub catalog: PlatformCatalog,
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate and freeze the configuration; `env_max_jobs` is the raw
    /// value of [`MAX_JOBS_ENV`], if set.
    pub fn resolve(self, env_max_jobs: Option<&str>) -> Result<ResolvedConfig, ConfigError> {
        validate_url("snapshots_url", &self.snapshots_url)?;

        let settings = RuntimeSettings {
            max_jobs: resolve_max_jobs(self.max_jobs, env_max_jobs)?,
            caps: WorkerCaps::new(self.max_parallel_builds),
            tree_stable: Duration::from_secs(self.tree_stable_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            layout: Layout {
                data_dir: self.data_dir,
                configuration_dir: self.configuration_dir,
                snapshots_dir: self.snapshots_dir,
                snapshots_url: self.snapshots_url,
            },
        };

        let projects = self
            .projects
            .into_iter()
            .map(ProjectConfig::into_project)
            .collect::<Result<Vec<_>, _>>()?;
        let projects = ProjectSet::new(projects)?;

        let catalog = PlatformCatalog::new(
            self.platforms
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn Platform>)
                .collect(),
        )?;
        catalog.check_references(&projects)?;

        Ok(ResolvedConfig {
            settings,
            projects,
            catalog,
        })
    }
}

/// The environment wins over the file; both fall back to CPU count plus one.
pub fn resolve_max_jobs(configured: Option<u32>, env: Option<&str>) -> Result<u32, ConfigError> {
    let jobs = match env.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidMaxJobs(raw.to_string()))?,
        None => configured.unwrap_or_else(RuntimeSettings::default_max_jobs),
    };
    if jobs == 0 {
        return Err(ConfigError::ZeroMaxJobs);
    }
    Ok(jobs)
}

/// Create the data directory tree.
pub fn prepare_dirs(layout: &Layout) -> std::io::Result<()> {
    for sub in Layout::DATA_SUBDIRS {
        std::fs::create_dir_all(layout.data_dir.join(sub))?;
    }
    std::fs::create_dir_all(&layout.snapshots_dir)?;
    Ok(())
}
