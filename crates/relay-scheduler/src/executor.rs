//! Stage executor that only logs what it would do.

use async_trait::async_trait;
use relay_core::action::{ActionContext, ActionOutcome, StageAction};
use relay_core::ports::StageExecutor;
use relay_core::properties::{BuildProperties, GOT_REVISION};
use tracing::info;

/// Revision recorded by a dry-run source update when none was pinned.
pub const DRY_RUN_REVISION: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl StageExecutor for DryRunExecutor {
    async fn execute(
        &self,
        action: &StageAction,
        ctx: &ActionContext,
        properties: &mut BuildProperties,
    ) -> ActionOutcome {
        let detail = match action {
            StageAction::UpdateSource { repo_url, branch } => {
                if properties.revision().is_none() {
                    properties.set(GOT_REVISION, DRY_RUN_REVISION);
                }
                format!("git {repo_url} {branch}")
            }
            StageAction::ApplyPatches { patches, .. } => patches.join(" "),
            StageAction::Configure { command }
            | StageAction::Compile { command }
            | StageAction::RunTests { command }
            | StageAction::BuildTestRunner { command }
            | StageAction::Strip { command } => command.to_string(),
            StageAction::Package { plan, .. } => format!(
                "{}-{}.{} -> {}",
                plan.build_name,
                plan.platform_name,
                plan.archive_format,
                plan.dst_path.display()
            ),
            other => other.label().to_string(),
        };
        info!(
            target_name = %ctx.target,
            workdir = %ctx.workdir.display(),
            action = action.label(),
            detail = %detail,
            "[dry-run] would run"
        );
        ActionOutcome::Success
    }
}
