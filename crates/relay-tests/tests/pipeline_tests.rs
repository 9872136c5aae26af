//! End-to-end pipeline runs against the scripted executor.

use filetime::{FileTime, set_file_mtime};
use pretty_assertions::assert_eq;
use relay_core::properties::{BRANCH, BuildProperties, PLATFORM_NAME, PROJECT, REASON, REPOSITORY};
use relay_core::target::{BuildResult, TargetState};
use relay_core::trigger::ForceRequest;
use relay_scheduler::ChangeDispatcher;
use relay_tests::{
    CONFIG_MK, PlatformFixture, ProjectFixture, ScriptedExecutor, TestPipeline, fired_schedulers,
    init_test_logging, state_sequence,
};
use std::time::Duration;
use tokio::sync::mpsc;

fn alpha_pipeline(executor: ScriptedExecutor) -> TestPipeline {
    TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .platform(PlatformFixture::windows())
        .max_parallel_builds(2)
        .executor(executor)
        .build()
}

#[tokio::test]
async fn test_change_builds_every_platform() {
    init_test_logging();
    let pipeline = alpha_pipeline(ScriptedExecutor::new().with_revisions(&["c0ffee"]));

    let report = pipeline
        .runtime
        .fire("branch-scheduler-alpha", BuildProperties::new())
        .await
        .unwrap();
    assert_eq!(report.result(), BuildResult::Success);

    assert_eq!(
        pipeline.executor.ran("fetch-alpha"),
        vec!["update-source", "apply-patches"]
    );
    assert_eq!(
        pipeline.executor.ran("alpha-linux"),
        vec!["configure", "compile", "run-tests", "strip"]
    );
    assert_eq!(
        pipeline.executor.ran("alpha-windows"),
        vec!["configure", "compile", "build-test-runner"]
    );

    let linux = report.find("alpha-linux").unwrap();
    assert_eq!(linux.properties.revision(), Some("c0ffee"));
    assert_eq!(linux.properties.text(PROJECT), Some("alpha"));
    assert_eq!(linux.properties.text(REPOSITORY), Some(ProjectFixture::ALPHA_URL));
    assert_eq!(linux.properties.text(BRANCH), Some("main"));
    assert_eq!(linux.properties.text(PLATFORM_NAME), Some("linux"));
    assert!(!linux.properties.clean());
    assert!(!linux.properties.package());

    assert_eq!(
        fired_schedulers(&pipeline.sink.events()),
        vec!["branch-scheduler-alpha", "build-scheduler-alpha"]
    );
    // The signal only records the revision.
    assert_eq!(
        pipeline.runtime.recorder().pending("alpha").await.unwrap().as_deref(),
        Some("c0ffee")
    );
}

#[tokio::test]
async fn test_platform_failure_is_local() {
    let pipeline = alpha_pipeline(ScriptedExecutor::new().failing("alpha-windows", "compile"));

    let report = pipeline
        .runtime
        .fire("branch-scheduler-alpha", BuildProperties::new())
        .await
        .unwrap();
    assert_eq!(report.result(), BuildResult::Failure);

    let fetch = report.find("fetch-alpha").unwrap();
    assert_eq!(fetch.failed_action.as_deref(), Some("trigger-build"));
    assert_eq!(fetch.reason.as_deref(), Some("1 of 2 triggered builds failed"));

    let windows = report.find("alpha-windows").unwrap();
    assert_eq!(windows.result, BuildResult::Failure);
    assert_eq!(windows.failed_action.as_deref(), Some("compile"));
    assert_eq!(
        pipeline.executor.ran("alpha-windows"),
        vec!["configure", "compile"]
    );

    assert_eq!(report.find("alpha-linux").unwrap().result, BuildResult::Success);
    assert_eq!(
        state_sequence(&pipeline.sink.events(), "alpha-windows"),
        vec![
            TargetState::Pending,
            TargetState::Locked,
            TargetState::Running,
            TargetState::Failed,
            TargetState::Released,
        ]
    );
}

#[tokio::test]
async fn test_forced_build_carries_operator_flags() {
    let pipeline = alpha_pipeline(ScriptedExecutor::new());

    let report = pipeline
        .runtime
        .force(
            "force-scheduler-alpha-fetch",
            ForceRequest::new("toolchain update").clean(true).package(true),
        )
        .await
        .unwrap();
    assert!(report.result().is_success());

    let linux = report.find("alpha-linux").unwrap();
    assert!(linux.properties.clean());
    assert!(linux.properties.package());
    assert_eq!(linux.properties.text(REASON), Some("toolchain update"));
    assert_eq!(linux.properties.text(REPOSITORY), Some(ProjectFixture::ALPHA_URL));
    assert_eq!(
        pipeline.executor.ran("alpha-linux"),
        vec![
            "clean",
            "configure",
            "compile",
            "run-tests",
            "strip",
            "package-manifest",
            "package-archive",
            "package-publish",
        ]
    );
}

#[tokio::test]
async fn test_nightly_builds_recorded_revision_once() {
    let pipeline = alpha_pipeline(ScriptedExecutor::new().with_revisions(&["r1"]));

    // Nothing observed yet.
    let idle = pipeline.runtime.fire_nightly("alpha").await.unwrap();
    assert!(idle.is_noop());
    assert!(pipeline.executor.ran("alpha-linux").is_empty());

    pipeline
        .runtime
        .fire("branch-scheduler-alpha", BuildProperties::new())
        .await
        .unwrap();
    let before = pipeline.executor.calls().len();

    let nightly = pipeline.runtime.fire_nightly("alpha").await.unwrap();
    assert!(nightly.result().is_success());
    assert!(!nightly.is_noop());
    let linux = nightly.find("alpha-linux").unwrap();
    assert_eq!(linux.properties.revision(), Some("r1"));
    assert!(linux.properties.clean());
    assert!(linux.properties.package());

    // The nightly never touches the source tree.
    let nightly_calls = &pipeline.executor.calls()[before..];
    assert!(nightly_calls.iter().all(|c| c.action != "update-source"));

    let again = pipeline.runtime.fire_nightly("alpha").await.unwrap();
    assert!(again.is_noop());
    assert_eq!(
        state_sequence(&pipeline.sink.events(), "nightly-alpha")
            .iter()
            .filter(|s| **s == TargetState::Running)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_configure_runs_only_when_stale() {
    let pipeline = alpha_pipeline(ScriptedExecutor::new());
    let build = |props: BuildProperties| pipeline.runtime.fire("branch-scheduler-alpha", props);

    build(BuildProperties::new()).await.unwrap();
    let config_mk = pipeline
        .settings
        .layout
        .build_dir("linux", "alpha")
        .join(CONFIG_MK);
    assert!(config_mk.is_file());

    build(BuildProperties::new()).await.unwrap();
    let runs = pipeline.executor.ran("alpha-linux");
    assert_eq!(runs.iter().filter(|a| *a == "configure").count(), 1);
    assert_eq!(runs.iter().filter(|a| *a == "compile").count(), 2);

    // A fetch that rewrites the configure script forces a reconfigure.
    let configure = pipeline.settings.layout.src_dir("alpha").join("configure");
    let later = FileTime::from_unix_time(FileTime::now().unix_seconds() + 3_600, 0);
    set_file_mtime(&configure, later).unwrap();
    build(BuildProperties::new()).await.unwrap();
    let runs = pipeline.executor.ran("alpha-linux");
    assert_eq!(runs.iter().filter(|a| *a == "configure").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_debounced_burst_fires_once() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .tree_stable(Duration::from_secs(300))
        .build();

    let (change_tx, change_rx) = mpsc::channel(16);
    let (firing_tx, mut firing_rx) = mpsc::channel(4);
    let dispatcher = ChangeDispatcher::from_graph(&pipeline.graph);
    let handle = tokio::spawn(dispatcher.run(change_rx, firing_tx));

    for (i, gap) in [0u64, 30, 60, 90].into_iter().enumerate() {
        tokio::time::sleep(Duration::from_secs(gap)).await;
        change_tx
            .send(relay_core::ports::Change::new(
                ProjectFixture::ALPHA_URL,
                "main",
                format!("rev{i}"),
            ))
            .await
            .unwrap();
    }
    // Wrong branch: ignored.
    change_tx
        .send(relay_core::ports::Change::new(ProjectFixture::ALPHA_URL, "develop", "x"))
        .await
        .unwrap();

    let firing = firing_rx.recv().await.unwrap();
    assert_eq!(firing.changes.len(), 4);
    let report = pipeline.runtime.on_change(firing).await.unwrap();
    assert!(report.result().is_success());

    drop(change_tx);
    handle.await.unwrap();
    assert!(firing_rx.recv().await.is_none());
    assert_eq!(
        fired_schedulers(&pipeline.sink.events())
            .iter()
            .filter(|s| *s == "branch-scheduler-alpha")
            .count(),
        1
    );
}
