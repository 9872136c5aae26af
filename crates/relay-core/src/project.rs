//! Project model.
//!
//! A project is one source repository branch that is fetched once and then
//! built independently on every eligible platform. Projects are built once at
//! startup and never mutated afterwards.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Time of day at which the nightly snapshot of a project is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NightlySchedule {
    pub hour: u8,
    pub minute: u8,
}

impl NightlySchedule {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::InvalidSchedule { hour, minute });
        }
        Ok(Self { hour, minute })
    }

    /// Six-field cron expression (seconds first) firing once a day.
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }
}

/// Where the sources of a project live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceRef {
    /// Canonical repository location.
    pub base_url: String,
    /// Clone URL, `{base_url}.git` unless given.
    pub git_url: String,
    pub branch: String,
}

impl SourceRef {
    pub fn new(base_url: impl Into<String>, branch: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            git_url: format!("{base_url}.git"),
            base_url,
            branch: branch.into(),
        }
    }

    pub fn with_git_url(mut self, git_url: impl Into<String>) -> Self {
        self.git_url = git_url.into();
        self
    }

    /// Repository URLs a change may be reported under.
    pub fn aliases(&self) -> Vec<String> {
        if self.base_url == self.git_url {
            vec![self.base_url.clone()]
        } else {
            vec![self.base_url.clone(), self.git_url.clone()]
        }
    }

    /// Change filter: repository must be one of the aliases, branch must match.
    pub fn matches(&self, repository: &str, branch: &str) -> bool {
        branch == self.branch && (repository == self.base_url || repository == self.git_url)
    }
}

/// A buildable project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub name: String,
    pub source: SourceRef,
    #[serde(default)]
    pub nightly: Option<NightlySchedule>,
    #[serde(default = "default_enable_force")]
    pub enable_force: bool,
    #[serde(default)]
    description: Option<String>,
    /// Patch files applied after every source update, relative to the configuration directory.
    #[serde(default)]
    pub patches: Vec<String>,
    /// Files from the source tree shipped in every package.
    #[serde(default)]
    pub data_files: Vec<String>,
    /// Configure flags common to all platforms.
    #[serde(default)]
    pub configure_flags: Vec<String>,
    #[serde(default)]
    pub verbose_build: bool,
    /// Whether the project ships a test suite at all.
    #[serde(default = "default_tests")]
    pub tests: bool,
}

fn default_enable_force() -> bool {
    true
}

fn default_tests() -> bool {
    true
}

impl Project {
    pub fn new(name: impl Into<String>, source: SourceRef) -> Self {
        Self {
            name: name.into(),
            source,
            nightly: None,
            enable_force: true,
            description: None,
            patches: vec![],
            data_files: vec![],
            configure_flags: vec![],
            verbose_build: false,
            tests: true,
        }
    }

    pub fn with_nightly(mut self, schedule: NightlySchedule) -> Self {
        self.nightly = Some(schedule);
        self
    }

    pub fn with_force(mut self, enabled: bool) -> Self {
        self.enable_force = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_patches(mut self, patches: Vec<String>) -> Self {
        self.patches = patches;
        self
    }

    pub fn with_data_files(mut self, files: Vec<String>) -> Self {
        self.data_files = files;
        self
    }

    pub fn with_configure_flags(mut self, flags: Vec<String>) -> Self {
        self.configure_flags = flags;
        self
    }

    pub fn with_verbose_build(mut self, verbose: bool) -> Self {
        self.verbose_build = verbose;
        self
    }

    pub fn with_tests(mut self, tests: bool) -> Self {
        self.tests = tests;
        self
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.name)
    }

    pub fn has_schedule(&self) -> bool {
        self.nightly.is_some()
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.name).map_err(|message| Error::InvalidProject {
            project: self.name.clone(),
            message,
        })?;
        if self.source.branch.is_empty() {
            return Err(Error::InvalidProject {
                project: self.name.clone(),
                message: "branch must not be empty".to_string(),
            });
        }
        if let Some(schedule) = self.nightly {
            NightlySchedule::new(schedule.hour, schedule.minute)?;
        }
        Ok(())
    }
}

/// Checks that a project or platform name is usable in derived identifiers.
pub(crate) fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("invalid character {c:?} in name"));
    }
    Ok(())
}

/// Ordered set of projects with globally unique names.
#[derive(Debug, Clone, Default)]
pub struct ProjectSet {
    projects: Vec<Arc<Project>>,
}

impl ProjectSet {
    pub fn new(projects: impl IntoIterator<Item = Project>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut validated = Vec::new();
        for project in projects {
            project.validate()?;
            if !seen.insert(project.name.clone()) {
                return Err(Error::DuplicateProject(project.name));
            }
            validated.push(Arc::new(project));
        }
        Ok(Self {
            projects: validated,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Project>> {
        self.projects.iter()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}
