//! Git branch poller feeding the change-triggered schedulers.

use async_trait::async_trait;
use relay_core::ports::{Change, ChangeSource, StateStore};
use relay_core::project::Project;
use relay_core::{Error, Result};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Watches one project branch with `git ls-remote`.
pub struct GitPoller {
    project: String,
    base_url: String,
    git_url: String,
    branch: String,
    store: Arc<dyn StateStore>,
}

impl GitPoller {
    pub fn new(project: &Project, store: Arc<dyn StateStore>) -> Self {
        Self {
            project: project.name.clone(),
            base_url: project.source.base_url.clone(),
            git_url: project.source.git_url.clone(),
            branch: project.source.branch.clone(),
            store,
        }
    }

    async fn remote_head(&self) -> Result<Option<String>> {
        let reference = format!("refs/heads/{}", self.branch);
        let output = Command::new("git")
            .args(["ls-remote", self.git_url.as_str(), reference.as_str()])
            .output()
            .await
            .map_err(|e| Error::Internal(format!("Command execution failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal(format!(
                "git ls-remote {} failed with exit code {:?}: {}",
                self.git_url,
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(parse_ls_remote(
            &String::from_utf8_lossy(&output.stdout),
            &reference,
        ))
    }

    /// Compare a freshly observed head with the stored one.
    ///
    /// The first observation only records the head; afterwards a differing
    /// head becomes a change on the canonical repository URL.
    pub async fn record(&self, head: &str) -> Result<Option<Change>> {
        let previous = self.store.poller_revision(&self.project).await?;
        if previous.as_deref() == Some(head) {
            return Ok(None);
        }
        self.store.set_poller_revision(&self.project, head).await?;

        match previous {
            None => {
                info!(project = %self.project, revision = %head, "Recorded initial branch head");
                Ok(None)
            }
            Some(previous) => {
                debug!(
                    project = %self.project,
                    from = %previous,
                    to = %head,
                    "Branch head moved"
                );
                Ok(Some(Change::new(&self.base_url, &self.branch, head)))
            }
        }
    }
}

#[async_trait]
impl ChangeSource for GitPoller {
    async fn poll(&self) -> Result<Vec<Change>> {
        let Some(head) = self.remote_head().await? else {
            debug!(project = %self.project, branch = %self.branch, "Branch not found on remote");
            return Ok(vec![]);
        };
        Ok(self.record(&head).await?.into_iter().collect())
    }
}

/// Revision of `reference` in `git ls-remote` output.
pub fn parse_ls_remote(output: &str, reference: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (sha, name) = line.split_once('\t')?;
        (name.trim() == reference && !sha.is_empty()).then(|| sha.trim().to_string())
    })
}
