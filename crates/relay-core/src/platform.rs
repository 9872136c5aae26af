//! Platform catalog.
//!
//! A platform is a target build environment. The orchestration core never
//! inspects platforms beyond the [`Platform`] trait: one implementing value per
//! platform, stored in an ordered [`PlatformCatalog`].

use crate::project::{Project, ProjectSet, validate_name};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Command descriptor handed to an external stage executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CommandSpec(Vec<String>);

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// Capability interface a project asks of a platform.
pub trait Platform: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn can_build(&self, project: &Project) -> bool;

    fn can_build_tests(&self, project: &Project) -> bool;

    /// Whether test binaries can be executed natively (false when cross-compiling).
    fn can_run_tests(&self, project: &Project) -> bool;

    fn can_package(&self, project: &Project) -> bool;

    fn configure_args(&self, project: &Project) -> Vec<String>;

    fn env(&self, project: &Project) -> BTreeMap<String, String>;

    fn data_files(&self, _project: &Project) -> Vec<String> {
        vec![]
    }

    fn built_files(&self, _project: &Project) -> Vec<String> {
        vec![]
    }

    fn strip_cmd(&self, _project: &Project) -> Option<CommandSpec> {
        None
    }

    /// Platform-specific packaging command; replaces stripping when present.
    fn packaging_cmd(&self, _project: &Project) -> Option<CommandSpec> {
        None
    }

    fn worker_image(&self, project: &Project) -> String;

    fn archive_ext(&self) -> &str;

    /// Project names this platform refers to, checked against the project set at startup.
    fn referenced_projects(&self) -> Vec<String> {
        vec![]
    }
}

/// Selects the projects a platform capability applies to.
///
/// An empty filter allows every project; `only: []` allows none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectFilter {
    #[serde(default)]
    pub only: Option<Vec<String>>,
    #[serde(default)]
    pub except: Vec<String>,
}

impl ProjectFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn none() -> Self {
        Self {
            only: Some(vec![]),
            except: vec![],
        }
    }

    pub fn only(projects: &[&str]) -> Self {
        Self {
            only: Some(projects.iter().map(|p| p.to_string()).collect()),
            except: vec![],
        }
    }

    pub fn except(projects: &[&str]) -> Self {
        Self {
            only: None,
            except: projects.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn allows(&self, project: &str) -> bool {
        let included = self
            .only
            .as_ref()
            .is_none_or(|only| only.iter().any(|p| p == project));
        included && !self.except.iter().any(|p| p == project)
    }

    fn referenced(&self) -> impl Iterator<Item = &String> {
        self.only.iter().flatten().chain(self.except.iter())
    }
}

/// Data-driven platform, as declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StaticPlatform {
    pub name: String,
    pub worker_image: String,
    #[serde(default = "default_archive_ext")]
    pub archive_ext: String,
    #[serde(default)]
    pub configure_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub data_files: Vec<String>,
    #[serde(default)]
    pub built_files: Vec<String>,
    #[serde(default)]
    pub strip_cmd: Option<CommandSpec>,
    #[serde(default)]
    pub packaging_cmd: Option<CommandSpec>,
    #[serde(default)]
    pub build: ProjectFilter,
    #[serde(default)]
    pub build_tests: ProjectFilter,
    #[serde(default)]
    pub run_tests: ProjectFilter,
    #[serde(default)]
    pub package: ProjectFilter,
}

fn default_archive_ext() -> String {
    "tar.xz".to_string()
}

impl StaticPlatform {
    pub fn new(name: impl Into<String>, worker_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_image: worker_image.into(),
            archive_ext: default_archive_ext(),
            configure_args: vec![],
            env: BTreeMap::new(),
            data_files: vec![],
            built_files: vec![],
            strip_cmd: None,
            packaging_cmd: None,
            build: ProjectFilter::all(),
            build_tests: ProjectFilter::all(),
            run_tests: ProjectFilter::all(),
            package: ProjectFilter::all(),
        }
    }
}

impl Platform for StaticPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_build(&self, project: &Project) -> bool {
        self.build.allows(&project.name)
    }

    fn can_build_tests(&self, project: &Project) -> bool {
        self.build_tests.allows(&project.name)
    }

    fn can_run_tests(&self, project: &Project) -> bool {
        self.run_tests.allows(&project.name)
    }

    fn can_package(&self, project: &Project) -> bool {
        self.package.allows(&project.name)
    }

    fn configure_args(&self, _project: &Project) -> Vec<String> {
        self.configure_args.clone()
    }

    fn env(&self, _project: &Project) -> BTreeMap<String, String> {
        self.env.clone()
    }

    fn data_files(&self, _project: &Project) -> Vec<String> {
        self.data_files.clone()
    }

    fn built_files(&self, _project: &Project) -> Vec<String> {
        self.built_files.clone()
    }

    fn strip_cmd(&self, _project: &Project) -> Option<CommandSpec> {
        self.strip_cmd.clone()
    }

    fn packaging_cmd(&self, _project: &Project) -> Option<CommandSpec> {
        self.packaging_cmd.clone()
    }

    fn worker_image(&self, _project: &Project) -> String {
        self.worker_image.clone()
    }

    fn archive_ext(&self) -> &str {
        &self.archive_ext
    }

    fn referenced_projects(&self) -> Vec<String> {
        self.build
            .referenced()
            .chain(self.build_tests.referenced())
            .chain(self.run_tests.referenced())
            .chain(self.package.referenced())
            .cloned()
            .collect()
    }
}

/// Ordered catalog of platforms with unique names.
#[derive(Debug, Clone, Default)]
pub struct PlatformCatalog {
    platforms: Vec<Arc<dyn Platform>>,
}

impl PlatformCatalog {
    pub fn new(platforms: Vec<Arc<dyn Platform>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for platform in &platforms {
            validate_name(platform.name()).map_err(|message| Error::InvalidPlatform {
                platform: platform.name().to_string(),
                message,
            })?;
            if !seen.insert(platform.name().to_string()) {
                return Err(Error::DuplicatePlatform(platform.name().to_string()));
            }
        }
        Ok(Self { platforms })
    }

    /// Checks that every project a platform names actually exists.
    pub fn check_references(&self, projects: &ProjectSet) -> Result<()> {
        for platform in &self.platforms {
            for name in platform.referenced_projects() {
                if projects.get(&name).is_none() {
                    return Err(Error::InvalidPlatform {
                        platform: platform.name().to_string(),
                        message: format!("unknown project {name}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Platforms that can build the project, in catalog order.
    pub fn eligible(&self, project: &Project) -> Vec<&Arc<dyn Platform>> {
        self.platforms
            .iter()
            .filter(|p| p.can_build(project))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Platform>> {
        self.platforms.iter().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Platform>> {
        self.platforms.iter()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::SourceRef;

    fn project(name: &str) -> Project {
        Project::new(name, SourceRef::new("https://example.org/repo", "main"))
    }

    #[test]
    fn test_filter_semantics() {
        assert!(ProjectFilter::all().allows("alpha"));
        assert!(!ProjectFilter::none().allows("alpha"));
        assert!(ProjectFilter::only(&["alpha"]).allows("alpha"));
        assert!(!ProjectFilter::only(&["alpha"]).allows("beta"));
        assert!(!ProjectFilter::except(&["alpha"]).allows("alpha"));
        assert!(ProjectFilter::except(&["alpha"]).allows("beta"));
    }

    #[test]
    fn test_eligible_keeps_catalog_order() {
        let mut windows = StaticPlatform::new("windows", "img/windows");
        windows.build = ProjectFilter::except(&["tools"]);
        let catalog = PlatformCatalog::new(vec![
            Arc::new(StaticPlatform::new("linux", "img/linux")),
            Arc::new(windows),
        ])
        .unwrap();

        let names: Vec<_> = catalog
            .eligible(&project("alpha"))
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["linux", "windows"]);
        assert_eq!(catalog.eligible(&project("tools")).len(), 1);
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let err = PlatformCatalog::new(vec![
            Arc::new(StaticPlatform::new("linux", "a")),
            Arc::new(StaticPlatform::new("linux", "b")),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicatePlatform(name) if name == "linux"));
    }

    #[test]
    fn test_unknown_project_reference_rejected() {
        let mut linux = StaticPlatform::new("linux", "img/linux");
        linux.package = ProjectFilter::only(&["ghost"]);
        let catalog = PlatformCatalog::new(vec![Arc::new(linux)]).unwrap();
        let projects = ProjectSet::new(vec![project("alpha")]).unwrap();
        assert!(catalog.check_references(&projects).is_err());
    }

    #[test]
    fn test_command_spec_parts() {
        let cmd = CommandSpec::new(["make", "-j4"]);
        assert_eq!(cmd.program(), Some("make"));
        assert_eq!(cmd.args(), &["-j4".to_string()]);
        assert_eq!(cmd.to_string(), "make -j4");
        assert!(CommandSpec::new(Vec::<String>::new()).args().is_empty());
    }
}
