//! Wire shape of the types shown by `relay graph` and carried in events.

use relay_core::action::{ActionOutcome, Guard, PlannedAction, StageAction};
use relay_core::lock::{LockRequest, LockScope, WorkerClass};
use relay_core::platform::{CommandSpec, StaticPlatform};
use relay_core::properties::{BuildProperties, CLEAN, GOT_REVISION};
use relay_core::target::TargetState;
use serde_json::json;

#[test]
fn test_stage_action_is_tagged_by_kind() {
    let action = StageAction::Compile {
        command: CommandSpec::new(["make", "-j5"]),
    };
    let value = serde_json::to_value(&action).expect("serialize");
    assert_eq!(value, json!({ "kind": "compile", "command": ["make", "-j5"] }));

    let parsed: StageAction =
        serde_json::from_value(json!({ "kind": "clean" })).expect("deserialize");
    assert_eq!(parsed, StageAction::Clean);
}

#[test]
fn test_planned_action_with_guard_and_locks() {
    let planned = PlannedAction::new(
        "update-source",
        StageAction::UpdateSource {
            repo_url: "https://example.org/alpha.git".to_string(),
            branch: "main".to_string(),
        },
    )
    .when(Guard::if_flag(CLEAN, false))
    .with_locks(vec![LockRequest::exclusive(LockScope::source("alpha"))]);

    let value = serde_json::to_value(&planned).expect("serialize");
    assert_eq!(value["guard"], json!({ "when": "if_flag", "property": "clean", "default": false }));
    assert_eq!(
        value["locks"],
        json!([{ "scope": { "scope": "source", "key": "alpha" }, "mode": "exclusive" }])
    );
    let parsed: PlannedAction = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, planned);
}

#[test]
fn test_properties_are_a_flat_map() {
    let props = BuildProperties::new()
        .with(GOT_REVISION, "abc123")
        .with(CLEAN, true);
    let value = serde_json::to_value(&props).expect("serialize");
    assert_eq!(value, json!({ "clean": true, "got_revision": "abc123" }));

    let parsed: BuildProperties = serde_json::from_value(value).expect("deserialize");
    assert!(parsed.clean());
    assert_eq!(parsed.revision(), Some("abc123"));
}

#[test]
fn test_static_platform_defaults() {
    let platform: StaticPlatform = serde_json::from_value(json!({
        "name": "linux",
        "worker_image": "relay/linux:latest",
        "strip_cmd": ["strip", "--strip-unneeded", "alpha"]
    }))
    .expect("deserialize");
    assert_eq!(platform.archive_ext, "tar.xz");
    assert!(platform.build.allows("anything"));
    assert_eq!(
        platform.strip_cmd.as_ref().and_then(|c| c.program()),
        Some("strip")
    );
}

#[test]
fn test_outcome_and_state_names() {
    assert_eq!(
        serde_json::to_value(ActionOutcome::failure("exit status 2")).expect("serialize"),
        json!({ "outcome": "failure", "reason": "exit status 2" })
    );
    assert_eq!(
        serde_json::to_value(TargetState::Released).expect("serialize"),
        json!("released")
    );
    assert_eq!(
        serde_json::to_value(LockScope::Worker(WorkerClass::Builder)).expect("serialize"),
        json!({ "scope": "worker", "key": "builder" })
    );
}
