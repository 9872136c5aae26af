//! Stage executor running git, build and packaging commands on the local host.

use async_trait::async_trait;
use relay_core::action::{ActionContext, ActionOutcome, PackagePhase, PackagePlan, StageAction};
use relay_core::platform::CommandSpec;
use relay_core::ports::StageExecutor;
use relay_core::properties::{BuildProperties, GOT_REVISION};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

type StepResult<T> = std::result::Result<T, String>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn update_source(
        &self,
        repo_url: &str,
        branch: &str,
        workdir: &Path,
        properties: &mut BuildProperties,
    ) -> StepResult<()> {
        let env = BTreeMap::new();
        if workdir.join(".git").is_dir() {
            // Undo the previous fetch's patches, including the files they added.
            run(&git(["reset", "--hard", "--quiet"]), workdir, &env).await?;
            run(&git(["clean", "-fdxq"]), workdir, &env).await?;
            run(&git(["fetch", "origin", branch]), workdir, &env).await?;
        } else {
            let parent = workdir.parent().unwrap_or(Path::new("/"));
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
            let dest = workdir.display().to_string();
            run(
                &git(["clone", "--branch", branch, repo_url, dest.as_str()]),
                parent,
                &env,
            )
            .await?;
        }

        let wanted = properties
            .revision()
            .map(str::to_string)
            .unwrap_or_else(|| "FETCH_HEAD".to_string());
        if wanted != "FETCH_HEAD" || workdir.join(".git").join("FETCH_HEAD").is_file() {
            run(&git(["checkout", "-f", wanted.as_str()]), workdir, &env).await?;
        }

        let head = run(&git(["rev-parse", "HEAD"]), workdir, &env).await?;
        let head = head.trim();
        if head.is_empty() {
            return Err("git rev-parse printed no revision".to_string());
        }
        properties.set(GOT_REVISION, head);
        Ok(())
    }

    async fn apply_patches(
        &self,
        base_dir: &Path,
        patches: &[String],
        workdir: &Path,
    ) -> StepResult<()> {
        let env = BTreeMap::new();
        for patch in patches {
            let path = base_dir.join(patch).display().to_string();
            run(&git(["apply", path.as_str()]), workdir, &env).await?;
        }
        Ok(())
    }

    async fn package(
        &self,
        phase: PackagePhase,
        plan: &PackagePlan,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> StepResult<()> {
        let stage_name = format!("{}-{}", plan.build_name, plan.platform_name);
        let archive_name = format!("{stage_name}.{}", plan.archive_format);
        match phase {
            PackagePhase::Manifest => stage_manifest(plan, workdir, &workdir.join(&stage_name)).await,
            PackagePhase::Archive => {
                let command = match &plan.dist_target {
                    Some(command) => command.clone(),
                    None if plan.archive_format == "zip" => CommandSpec::new([
                        "zip",
                        "-r",
                        archive_name.as_str(),
                        stage_name.as_str(),
                    ]),
                    None => CommandSpec::new([
                        "tar",
                        "-caf",
                        archive_name.as_str(),
                        stage_name.as_str(),
                    ]),
                };
                run(&command, workdir, env).await.map(|_| ())
            }
            PackagePhase::Publish => {
                tokio::fs::create_dir_all(&plan.dst_path)
                    .await
                    .map_err(|e| format!("Failed to create {}: {e}", plan.dst_path.display()))?;
                let from = workdir.join(&archive_name);
                let to = plan.dst_path.join(&archive_name);
                tokio::fs::copy(&from, &to)
                    .await
                    .map_err(|e| format!("Failed to publish {}: {e}", from.display()))?;
                info!(
                    archive = %archive_name,
                    url = %format!("{}{archive_name}", plan.dst_url),
                    "Snapshot published"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ShellExecutor {
    async fn execute(
        &self,
        action: &StageAction,
        ctx: &ActionContext,
        properties: &mut BuildProperties,
    ) -> ActionOutcome {
        let result = match action {
            StageAction::UpdateSource { repo_url, branch } => {
                self.update_source(repo_url, branch, &ctx.workdir, properties)
                    .await
            }
            StageAction::ApplyPatches { base_dir, patches } => {
                self.apply_patches(base_dir, patches, &ctx.workdir).await
            }
            StageAction::Clean => recreate_dir(&ctx.workdir).await,
            StageAction::Configure { command }
            | StageAction::Compile { command }
            | StageAction::RunTests { command }
            | StageAction::BuildTestRunner { command }
            | StageAction::Strip { command } => {
                match tokio::fs::create_dir_all(&ctx.workdir).await {
                    Ok(()) => run(command, &ctx.workdir, &ctx.env).await.map(|_| ()),
                    Err(e) => Err(format!("Failed to create {}: {e}", ctx.workdir.display())),
                }
            }
            StageAction::Package { phase, plan } => {
                self.package(*phase, plan, &ctx.workdir, &ctx.env).await
            }
            StageAction::SignalNightly { .. }
            | StageAction::TriggerFanOut { .. }
            | StageAction::CheckStaleness { .. } => Err(format!(
                "{} is interpreted by the pipeline runtime",
                action.label()
            )),
        };

        match result {
            Ok(()) => ActionOutcome::Success,
            Err(reason) => ActionOutcome::failure(reason),
        }
    }
}

fn git<const N: usize>(args: [&str; N]) -> CommandSpec {
    CommandSpec::new(std::iter::once("git").chain(args))
}

/// Run a command to completion and return its standard output.
async fn run(
    command: &CommandSpec,
    workdir: &Path,
    env: &BTreeMap<String, String>,
) -> StepResult<String> {
    let Some(program) = command.program() else {
        return Err("Empty command".to_string());
    };
    debug!(workdir = %workdir.display(), command = %command, "Running command");

    let output = Command::new(program)
        .args(command.args())
        .envs(env)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| format!("Command execution failed: {command}: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{command} failed with exit code {:?}: {}",
            output.status.code(),
            stderr.trim()
        ))
    }
}

async fn recreate_dir(dir: &Path) -> StepResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("Failed to remove {}: {e}", dir.display())),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("Failed to create {}: {e}", dir.display()))
}

/// Copy data files from the source tree and built files from the build
/// directory into a fresh staging directory.
async fn stage_manifest(plan: &PackagePlan, workdir: &Path, stage: &Path) -> StepResult<()> {
    recreate_dir(stage).await?;

    let sources = plan
        .build_data_files
        .iter()
        .chain(&plan.platform_data_files)
        .map(|file| (plan.src_path.join(file), file))
        .chain(
            plan.platform_built_files
                .iter()
                .map(|file| (workdir.join(file), file)),
        );

    for (from, relative) in sources {
        let to: PathBuf = stage.join(relative);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| format!("Failed to stage {}: {e}", from.display()))?;
    }
    Ok(())
}
