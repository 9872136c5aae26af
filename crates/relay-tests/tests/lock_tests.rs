//! Source-tree and worker-class locking under concurrent firings.

use relay_core::lock::{LockScope, WorkerClass};
use relay_core::properties::BuildProperties;
use relay_core::target::BuildResult;
use relay_core::trigger::ForceRequest;
use relay_tests::{
    PlatformFixture, ProjectFixture, ScriptedExecutor, TestPipeline, assert_source_exclusion,
    init_test_logging, peak_holders,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_fetch_excludes_concurrent_builds_of_same_tree() {
    init_test_logging();
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .platform(PlatformFixture::windows())
        .max_parallel_builds(2)
        .executor(
            ScriptedExecutor::new()
                .with_delay("update-source", Duration::from_secs(30))
                .with_delay("compile", Duration::from_secs(120)),
        )
        .build();
    let runtime = &pipeline.runtime;

    let (build_first, fetch, build_second) = tokio::join!(
        runtime.force("force-scheduler-alpha-build", ForceRequest::new("rebuild")),
        runtime.fire("branch-scheduler-alpha", BuildProperties::new()),
        runtime.force("force-scheduler-alpha-build", ForceRequest::new("rebuild again")),
    );
    assert_eq!(build_first.unwrap().result(), BuildResult::Success);
    assert_eq!(fetch.unwrap().result(), BuildResult::Success);
    assert_eq!(build_second.unwrap().result(), BuildResult::Success);

    let (exclusive, counting) = assert_source_exclusion(&pipeline.sink.events(), "alpha");
    assert_eq!(exclusive, 1);
    // Two forced fan-outs plus the one started by the fetch, two platforms each.
    assert_eq!(counting, 6);
    assert_eq!(runtime.locks().in_use(&LockScope::source("alpha")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_fetches_of_one_project_serialize() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .executor(
            ScriptedExecutor::new()
                .with_revisions(&["aaa", "bbb"])
                .with_delay("update-source", Duration::from_secs(10)),
        )
        .build();
    let runtime = &pipeline.runtime;

    let (auto, forced) = tokio::join!(
        runtime.fire("branch-scheduler-alpha", BuildProperties::new()),
        runtime.force("force-scheduler-alpha-fetch", ForceRequest::new("manual fetch")),
    );
    let auto = auto.unwrap();
    let forced = forced.unwrap();
    assert!(auto.result().is_success());
    assert!(forced.result().is_success());

    // Each fetch builds the revision it resolved itself.
    let mut revisions = vec![
        auto.find("alpha-linux").unwrap().properties.revision().unwrap().to_string(),
        forced.find("alpha-linux").unwrap().properties.revision().unwrap().to_string(),
    ];
    revisions.sort();
    assert_eq!(revisions, vec!["aaa", "bbb"]);

    let events = pipeline.sink.events();
    assert_eq!(peak_holders(&events, WorkerClass::Fetcher), 1);
    assert_eq!(assert_source_exclusion(&events, "alpha").0, 2);
}

#[tokio::test(start_paused = true)]
async fn test_builder_class_never_exceeds_cap() {
    let mut builder = TestPipeline::builder()
        .project(ProjectFixture::tools())
        .max_parallel_builds(2)
        .executor(ScriptedExecutor::new().with_delay("compile", Duration::from_secs(60)));
    for name in ["linux", "freebsd", "macos", "android", "windows"] {
        builder = builder.platform(PlatformFixture::named(name));
    }
    let pipeline = builder.build();

    let report = pipeline
        .runtime
        .force("force-scheduler-tools-build", ForceRequest::new("cap check"))
        .await
        .unwrap();
    assert_eq!(report.reports.len(), 5);
    assert!(report.result().is_success());

    let events = pipeline.sink.events();
    assert_eq!(peak_holders(&events, WorkerClass::Builder), 2);
    assert_eq!(
        pipeline
            .runtime
            .locks()
            .in_use(&LockScope::Worker(WorkerClass::Builder)),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_fetches_of_different_projects_share_one_fetcher() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .project(ProjectFixture::tools())
        .platform(PlatformFixture::named("linux"))
        .max_parallel_builds(4)
        .executor(ScriptedExecutor::new().with_delay("update-source", Duration::from_secs(5)))
        .build();

    let (alpha, tools) = tokio::join!(
        pipeline.runtime.fire("branch-scheduler-alpha", BuildProperties::new()),
        pipeline.runtime.fire("branch-scheduler-tools", BuildProperties::new()),
    );
    assert!(alpha.unwrap().result().is_success());
    assert!(tools.unwrap().result().is_success());
    assert_eq!(peak_holders(&pipeline.sink.events(), WorkerClass::Fetcher), 1);
}

// Real time: a blocked lock file keeps a paused clock from advancing.
#[tokio::test]
async fn test_forced_build_in_another_process_respects_fetch() {
    let pipeline = TestPipeline::builder()
        .project(ProjectFixture::alpha())
        .platform(PlatformFixture::linux())
        .platform(PlatformFixture::windows())
        .max_parallel_builds(2)
        .shared_locks()
        .executor(
            ScriptedExecutor::new()
                .with_delay("update-source", Duration::from_millis(50))
                .with_delay("compile", Duration::from_millis(200)),
        )
        .build();
    let forcing = pipeline.peer_runtime();

    let (forced, fetched) = tokio::join!(
        forcing.force("force-scheduler-alpha-build", ForceRequest::new("manual rebuild")),
        pipeline.runtime.fire("branch-scheduler-alpha", BuildProperties::new()),
    );
    assert_eq!(forced.unwrap().result(), BuildResult::Success);
    assert_eq!(fetched.unwrap().result(), BuildResult::Success);

    let (exclusive, counting) = assert_source_exclusion(&pipeline.sink.events(), "alpha");
    assert_eq!(exclusive, 1);
    assert_eq!(counting, 4);
    assert!(pipeline.settings.layout.lock_dir().join("src-alpha.lock").is_file());
}
