//! Trigger graph shape for different project and platform mixes.

use relay_core::Error;
use relay_core::platform::ProjectFilter;
use relay_core::properties::BuildProperties;
use relay_core::trigger::{ForceRequest, SchedulerKind};
use relay_tests::{PlatformFixture, ProjectFixture, TestPipeline};

fn scheduler_names(pipeline: &TestPipeline) -> Vec<String> {
    pipeline
        .graph
        .schedulers()
        .map(|s| s.name.to_string())
        .collect()
}

#[tokio::test]
async fn test_no_platforms_gives_empty_fan_out() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::tools())
        .build();

    let fan_out = pipeline.graph.scheduler("build-scheduler-tools").unwrap();
    assert!(fan_out.targets.is_empty());
    assert!(pipeline.graph.targets_for("tools").iter().all(|t| t.platform.is_none()));

    let report = pipeline
        .runtime
        .fire("branch-scheduler-tools", BuildProperties::new())
        .await
        .unwrap();
    assert!(report.result().is_success());
    assert!(report.find("fetch-tools").unwrap().children.is_empty());
}

#[test]
fn test_unscheduled_project_has_no_nightly() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::tools())
        .platform(PlatformFixture::linux())
        .build();

    let names = scheduler_names(&pipeline);
    assert!(!names.iter().any(|n| n.starts_with("nightly-")));
    assert!(pipeline.graph.target("nightly-tools").is_none());

    let fetch = pipeline.graph.target("fetch-tools").unwrap();
    let actions: Vec<&str> = fetch.actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(actions, vec!["update-source", "trigger-build"]);
}

#[test]
fn test_scheduled_project_graph() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .platform(PlatformFixture::windows())
        .build();

    let mut names = scheduler_names(&pipeline);
    names.sort();
    assert_eq!(
        names,
        vec![
            "branch-scheduler-alpha",
            "build-scheduler-alpha",
            "force-scheduler-alpha-build",
            "force-scheduler-alpha-fetch",
            "nightly-scheduler-alpha",
        ]
    );

    assert_eq!(pipeline.graph.schedulers_for("alpha").len(), 5);
    assert!(pipeline.graph.schedulers_for("beta").is_empty());

    let mut targets: Vec<String> = pipeline
        .graph
        .targets()
        .map(|t| t.name.to_string())
        .collect();
    targets.sort();
    assert_eq!(
        targets,
        vec!["alpha-linux", "alpha-windows", "fetch-alpha", "nightly-alpha"]
    );

    let mut fan_in_from: Vec<String> = pipeline
        .graph
        .triggered_from("build-scheduler-alpha")
        .into_iter()
        .map(|t| t.name.to_string())
        .collect();
    fan_in_from.sort();
    assert_eq!(fan_in_from, vec!["fetch-alpha", "nightly-alpha"]);

    let nightly = pipeline.graph.scheduler("nightly-scheduler-alpha").unwrap();
    match &nightly.kind {
        SchedulerKind::Nightly {
            hour,
            minute,
            only_if_changed,
            ..
        } => assert_eq!((*hour, *minute, *only_if_changed), (4, 1, true)),
        other => panic!("unexpected kind {other:?}"),
    }

    let fan_out = pipeline.graph.scheduler("build-scheduler-alpha").unwrap();
    assert!(fan_out.wait_for_finish);
    let targets: Vec<&str> = fan_out.targets.iter().map(|t| t.as_str()).collect();
    assert_eq!(targets, vec!["alpha-linux", "alpha-windows"]);

    let order: Vec<&str> = pipeline
        .graph
        .topological_order()
        .unwrap()
        .into_iter()
        .map(|node| node.name())
        .collect();
    let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(position("fetch-alpha") < position("build-scheduler-alpha"));
    assert!(position("build-scheduler-alpha") < position("alpha-linux"));
}

#[tokio::test]
async fn test_force_disabled_project() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::locked_down("gamma"))
        .build();

    assert!(!scheduler_names(&pipeline).iter().any(|n| n.starts_with("force-")));
    let err = pipeline
        .runtime
        .force("force-scheduler-gamma-build", ForceRequest::new("please"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchedulerNotFound(_)));

    let err = pipeline
        .runtime
        .force("branch-scheduler-gamma", ForceRequest::new("please"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotManual(_)));
}

#[test]
fn test_platform_filters() {
    let mut windows = PlatformFixture::windows();
    windows.build = ProjectFilter::only(&["alpha"]);
    windows.package = ProjectFilter::except(&["alpha"]);

    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .project(ProjectFixture::tools())
        .platform(PlatformFixture::linux())
        .platform(windows)
        .build();

    assert!(pipeline.graph.target("alpha-windows").is_some());
    assert!(pipeline.graph.target("tools-windows").is_none());
    assert!(pipeline.graph.target("tools-linux").is_some());

    let alpha_windows = pipeline.graph.target("alpha-windows").unwrap();
    assert!(
        !alpha_windows
            .actions
            .iter()
            .any(|a| a.name.starts_with("package-"))
    );
    let alpha_linux = pipeline.graph.target("alpha-linux").unwrap();
    assert_eq!(
        alpha_linux
            .actions
            .iter()
            .filter(|a| a.name.starts_with("package-"))
            .count(),
        3
    );
}
