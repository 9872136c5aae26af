//! Stage pipeline assembly.
//!
//! Turns a project, or a project/platform pair, into a [`BuildTarget`]: the
//! ordered action list, the locks each action needs and the declared
//! properties with their defaults.

use relay_core::action::{Guard, PackagePhase, PackagePlan, PlannedAction, StageAction};
use relay_core::ids::{SchedulerName, TargetName};
use relay_core::lock::{LockRequest, LockScope, WorkerClass};
use relay_core::platform::{CommandSpec, Platform};
use relay_core::project::Project;
use relay_core::properties::{
    BuildProperties, CLEAN, GOT_REVISION, NEEDS_CONFIGURE, PACKAGE, PLATFORM_NAME,
    PropertySource, WORKER_IMAGE,
};
use relay_core::settings::{Layout, RuntimeSettings};
use relay_core::target::{BuildTarget, TargetKind};
use std::collections::BTreeMap;

/// Generated build descriptor checked against the configure script.
pub const CONFIG_DESCRIPTOR: &str = "config.mk";
pub const CONFIGURE_SCRIPT: &str = "configure";

/// Builds the action lists of every target kind.
#[derive(Debug, Clone)]
pub struct PipelineAssembler {
    max_jobs: u32,
    layout: Layout,
}

impl PipelineAssembler {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            max_jobs: settings.max_jobs,
            layout: settings.layout.clone(),
        }
    }

    /// One per project: update the tree under the exclusive source lock,
    /// signal the nightly recorder, then fan out and join.
    pub fn fetch_target(&self, project: &Project) -> BuildTarget {
        let source = LockScope::source(&project.name);
        let write = vec![LockRequest::exclusive(source)];

        let mut actions = vec![
            PlannedAction::new(
                "update-source",
                StageAction::UpdateSource {
                    repo_url: project.source.git_url.clone(),
                    branch: project.source.branch.clone(),
                },
            )
            .with_locks(write.clone()),
        ];

        if !project.patches.is_empty() {
            actions.push(
                PlannedAction::new(
                    "apply-patches",
                    StageAction::ApplyPatches {
                        base_dir: self.layout.configuration_dir.clone(),
                        patches: project.patches.clone(),
                    },
                )
                .with_locks(write),
            );
        }

        if project.has_schedule() {
            actions.push(
                PlannedAction::new(
                    "signal-nightly",
                    StageAction::SignalNightly {
                        scheduler: SchedulerName::nightly(&project.name),
                    },
                )
                .quiet(),
            );
        }

        let carried = BTreeMap::from([
            (GOT_REVISION.to_string(), PropertySource::Inherit),
            (CLEAN.to_string(), PropertySource::InheritOr(false.into())),
            (PACKAGE.to_string(), PropertySource::InheritOr(false.into())),
        ]);
        actions.push(PlannedAction::new(
            "trigger-build",
            StageAction::TriggerFanOut {
                scheduler: SchedulerName::build(&project.name),
                set_properties: carried,
            },
        ));

        BuildTarget {
            name: TargetName::fetch(&project.name),
            kind: TargetKind::Fetch,
            project: project.name.clone(),
            platform: None,
            worker_class: WorkerClass::Fetcher,
            workdir: self.layout.src_dir(&project.name),
            locks: vec![LockRequest::counting(LockScope::Worker(WorkerClass::Fetcher))],
            actions,
            properties: BuildProperties::new()
                .with(CLEAN, false)
                .with(PACKAGE, false),
            env: BTreeMap::new(),
            tags: vec!["fetch".to_string(), project.name.clone()],
        }
    }

    /// Only for projects with a nightly schedule. Starts the fan-out with
    /// `clean` and `package` forced on; never touches the source tree.
    pub fn nightly_target(&self, project: &Project) -> Option<BuildTarget> {
        if !project.has_schedule() {
            return None;
        }

        let forced = BTreeMap::from([
            (GOT_REVISION.to_string(), PropertySource::Inherit),
            (CLEAN.to_string(), PropertySource::Fixed(true.into())),
            (PACKAGE.to_string(), PropertySource::Fixed(true.into())),
        ]);

        Some(BuildTarget {
            name: TargetName::nightly(&project.name),
            kind: TargetKind::Nightly,
            project: project.name.clone(),
            platform: None,
            worker_class: WorkerClass::Fetcher,
            workdir: self.layout.nightly_dir(&project.name),
            locks: vec![LockRequest::counting(LockScope::Worker(WorkerClass::Fetcher))],
            actions: vec![PlannedAction::new(
                "trigger-build",
                StageAction::TriggerFanOut {
                    scheduler: SchedulerName::build(&project.name),
                    set_properties: forced,
                },
            )],
            properties: BuildProperties::new(),
            env: BTreeMap::new(),
            tags: vec!["nightly".to_string(), project.name.clone()],
        })
    }

    /// `None` when the platform cannot build the project.
    pub fn platform_target(&self, project: &Project, platform: &dyn Platform) -> Option<BuildTarget> {
        if !platform.can_build(project) {
            return None;
        }

        let src_dir = self.layout.src_dir(&project.name);
        let workdir = self.layout.build_dir(platform.name(), &project.name);
        let configure_script = src_dir.join(CONFIGURE_SCRIPT);

        let mut actions = vec![
            PlannedAction::new("clean", StageAction::Clean).when(Guard::if_flag(CLEAN, false)),
            PlannedAction::new(
                "check-configure",
                StageAction::CheckStaleness {
                    source: configure_script.clone(),
                    generated: workdir.join(CONFIG_DESCRIPTOR),
                    property: NEEDS_CONFIGURE.to_string(),
                },
            ),
            PlannedAction::new(
                "configure",
                StageAction::Configure {
                    command: self.configure_command(project, platform, &configure_script),
                },
            )
            .when(Guard::if_flag(NEEDS_CONFIGURE, true)),
            PlannedAction::new(
                "compile",
                StageAction::Compile {
                    command: CommandSpec::new(["make".to_string(), format!("-j{}", self.max_jobs)]),
                },
            ),
        ];

        if project.tests && platform.can_build_tests(project) {
            if platform.can_run_tests(project) {
                actions.push(PlannedAction::new(
                    "test",
                    StageAction::RunTests {
                        command: CommandSpec::new(["make", "test"]),
                    },
                ));
            } else {
                actions.push(PlannedAction::new(
                    "test-runner",
                    StageAction::BuildTestRunner {
                        command: CommandSpec::new(["make", "test/runner"]),
                    },
                ));
            }
        }

        let packaging_cmd = platform.packaging_cmd(project);
        if packaging_cmd.is_none()
            && let Some(command) = platform.strip_cmd(project)
        {
            actions.push(PlannedAction::new("strip", StageAction::Strip { command }));
        }

        if platform.can_package(project) {
            let plan = Box::new(PackagePlan {
                build_name: project.name.clone(),
                platform_name: platform.name().to_string(),
                src_path: src_dir,
                dst_path: self.layout.snapshots_path(&project.name),
                dst_url: self.layout.snapshots_url_for(&project.name),
                archive_format: platform.archive_ext().to_string(),
                dist_target: packaging_cmd,
                build_data_files: project.data_files.clone(),
                platform_data_files: platform.data_files(project),
                platform_built_files: platform.built_files(project),
            });
            for phase in [PackagePhase::Manifest, PackagePhase::Archive, PackagePhase::Publish] {
                let action = StageAction::Package {
                    phase,
                    plan: plan.clone(),
                };
                actions.push(
                    PlannedAction::new(action.label(), action).when(Guard::if_flag(PACKAGE, false)),
                );
            }
        }

        Some(BuildTarget {
            name: TargetName::platform(&project.name, platform.name()),
            kind: TargetKind::Platform,
            project: project.name.clone(),
            platform: Some(platform.name().to_string()),
            worker_class: WorkerClass::Builder,
            workdir,
            locks: vec![
                LockRequest::counting(LockScope::Worker(WorkerClass::Builder)),
                LockRequest::counting(LockScope::source(&project.name)),
            ],
            actions,
            properties: BuildProperties::new()
                .with(PLATFORM_NAME, platform.name())
                .with(WORKER_IMAGE, platform.worker_image(project)),
            env: platform.env(project),
            tags: vec![project.name.clone()],
        })
    }

    fn configure_command(
        &self,
        project: &Project,
        platform: &dyn Platform,
        script: &std::path::Path,
    ) -> CommandSpec {
        let mut argv = vec![script.display().to_string()];
        argv.extend(project.configure_flags.iter().cloned());
        if project.verbose_build {
            argv.push("--enable-verbose-build".to_string());
        }
        argv.extend(platform.configure_args(project));
        CommandSpec::new(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relay_core::lock::LockMode;
    use relay_core::platform::{ProjectFilter, StaticPlatform};
    use relay_core::project::{NightlySchedule, SourceRef};
    use std::path::PathBuf;

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            max_jobs: 9,
            ..Default::default()
        }
    }

    fn project() -> Project {
        Project::new("alpha", SourceRef::new("https://example.org/alpha", "main"))
    }

    fn action_names(target: &BuildTarget) -> Vec<&str> {
        target.actions.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_fetch_target_without_patches_or_schedule() {
        let target = PipelineAssembler::new(&settings()).fetch_target(&project());
        assert_eq!(target.name, "fetch-alpha");
        assert_eq!(target.workdir, PathBuf::from("/data/src/alpha"));
        assert_eq!(action_names(&target), vec!["update-source", "trigger-build"]);
        assert_eq!(
            target.actions[0].locks,
            vec![LockRequest::exclusive(LockScope::source("alpha"))]
        );
        assert!(target.actions[1].locks.is_empty());
    }

    #[test]
    fn test_fetch_target_with_patches_and_schedule() {
        let project = project()
            .with_patches(vec!["fix-build.patch".to_string()])
            .with_nightly(NightlySchedule::new(4, 1).unwrap());
        let target = PipelineAssembler::new(&settings()).fetch_target(&project);
        assert_eq!(
            action_names(&target),
            vec!["update-source", "apply-patches", "signal-nightly", "trigger-build"]
        );
        assert_eq!(target.actions[0].locks, target.actions[1].locks);
        assert!(target.actions[2].quiet_on_success);
        let (scheduler, wait) = target.actions[2].action.triggered_scheduler().unwrap();
        assert_eq!(scheduler, "nightly-scheduler-alpha");
        assert!(!wait);
    }

    #[test]
    fn test_nightly_target_forces_flags() {
        let assembler = PipelineAssembler::new(&settings());
        assert!(assembler.nightly_target(&project()).is_none());

        let project = project().with_nightly(NightlySchedule::new(4, 1).unwrap());
        let target = assembler.nightly_target(&project).unwrap();
        assert_eq!(target.workdir, PathBuf::from("/data/triggers/nightly-alpha"));
        assert_eq!(target.worker_class, WorkerClass::Fetcher);

        let StageAction::TriggerFanOut { set_properties, .. } = &target.actions[0].action else {
            panic!("nightly target must fan out");
        };
        let props = BuildProperties::new()
            .with(GOT_REVISION, "abc123")
            .propagate(set_properties);
        assert!(props.clean());
        assert!(props.package());
        assert_eq!(props.revision(), Some("abc123"));
    }

    #[test]
    fn test_platform_target_sequence() {
        let mut linux = StaticPlatform::new("linux", "relay/linux:latest");
        linux.strip_cmd = Some(CommandSpec::new(["strip", "alpha"]));
        linux.configure_args = vec!["--host=x86_64-linux-gnu".to_string()];
        let project = project()
            .with_configure_flags(vec!["--enable-all".to_string()])
            .with_verbose_build(true);

        let target = PipelineAssembler::new(&settings())
            .platform_target(&project, &linux)
            .unwrap();

        assert_eq!(target.name, "alpha-linux");
        assert_eq!(target.workdir, PathBuf::from("/data/builds/linux/alpha"));
        assert_eq!(
            action_names(&target),
            vec![
                "clean",
                "check-configure",
                "configure",
                "compile",
                "test",
                "strip",
                "package-manifest",
                "package-archive",
                "package-publish",
            ]
        );
        assert_eq!(target.properties.text(PLATFORM_NAME), Some("linux"));
        assert_eq!(target.properties.text(WORKER_IMAGE), Some("relay/linux:latest"));
        assert!(target.locks.iter().all(|l| l.mode == LockMode::Counting));

        let StageAction::Configure { command } = &target.actions[2].action else {
            panic!("expected configure");
        };
        assert_eq!(
            command.argv(),
            &[
                "/data/src/alpha/configure",
                "--enable-all",
                "--enable-verbose-build",
                "--host=x86_64-linux-gnu",
            ]
        );

        let StageAction::Compile { command } = &target.actions[3].action else {
            panic!("expected compile");
        };
        assert_eq!(command.argv(), &["make", "-j9"]);
    }

    #[test]
    fn test_cross_platform_builds_runner_and_uses_packaging_command() {
        let mut windows = StaticPlatform::new("windows", "relay/mingw:latest");
        windows.run_tests = ProjectFilter::none();
        windows.strip_cmd = Some(CommandSpec::new(["strip"]));
        windows.packaging_cmd = Some(CommandSpec::new(["make", "win32dist"]));
        windows.archive_ext = "zip".to_string();

        let target = PipelineAssembler::new(&settings())
            .platform_target(&project(), &windows)
            .unwrap();
        let names = action_names(&target);
        assert!(names.contains(&"test-runner"));
        assert!(!names.contains(&"strip"));

        let StageAction::Package { plan, .. } = &target.actions.last().unwrap().action else {
            panic!("expected package phase last");
        };
        assert_eq!(plan.archive_format, "zip");
        assert_eq!(plan.dst_url, "http://localhost/snapshots/alpha/");
        assert_eq!(
            plan.dist_target.as_ref().map(|c| c.argv().to_vec()),
            Some(vec!["make".to_string(), "win32dist".to_string()])
        );
    }

    #[test]
    fn test_ineligible_platform_has_no_target() {
        let mut amiga = StaticPlatform::new("amiga", "relay/amiga:latest");
        amiga.build = ProjectFilter::except(&["alpha"]);
        assert!(
            PipelineAssembler::new(&settings())
                .platform_target(&project(), &amiga)
                .is_none()
        );
    }

    #[test]
    fn test_projects_without_tests_skip_test_actions() {
        let linux = StaticPlatform::new("linux", "relay/linux:latest");
        let target = PipelineAssembler::new(&settings())
            .platform_target(&project().with_tests(false), &linux)
            .unwrap();
        let names = action_names(&target);
        assert!(!names.contains(&"test"));
        assert!(!names.contains(&"test-runner"));
    }
}
