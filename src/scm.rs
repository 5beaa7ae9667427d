//! Source control provider
//!
//! Thin shim over the `git` binary for branch/worktree isolation. Lifecycle
//! code treats every call here as best-effort: a failed branch operation is
//! logged, never allowed to abort instance teardown.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("git command failed: {0}")]
    CommandFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of merging one branch into another
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    /// Paths left in conflict when the merge did not complete
    pub conflicts: Vec<String>,
}

/// Branch and worktree operations used around Specialist lifecycles
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn create_branch(&self, repo: &Path, name: &str) -> Result<(), ScmError>;

    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), ScmError>;

    async fn merge(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<MergeOutcome, ScmError>;
}

/// Production provider shelling out to `git`
#[derive(Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String, ScmError> {
        debug!(repo = %repo.display(), args = ?args, "git");
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ScmError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn create_branch(&self, repo: &Path, name: &str) -> Result<(), ScmError> {
        self.git(repo, &["branch", name]).await?;
        Ok(())
    }

    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), ScmError> {
        let path = path.to_string_lossy();
        self.git(repo, &["worktree", "add", "-b", branch, &path])
            .await?;
        Ok(())
    }

    async fn merge(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<MergeOutcome, ScmError> {
        self.git(repo, &["checkout", target]).await?;
        match self.git(repo, &["merge", "--no-edit", source]).await {
            Ok(_) => Ok(MergeOutcome {
                success: true,
                conflicts: Vec::new(),
            }),
            Err(_) => {
                let conflicted = self
                    .git(repo, &["diff", "--name-only", "--diff-filter=U"])
                    .await
                    .unwrap_or_default();
                let conflicts: Vec<String> =
                    conflicted.lines().map(str::to_string).collect();
                self.git(repo, &["merge", "--abort"]).await.ok();
                Ok(MergeOutcome {
                    success: false,
                    conflicts,
                })
            }
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! Recording no-op provider for unit tests

    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{MergeOutcome, ScmError, SourceControl};

    #[derive(Default)]
    pub struct FakeScm {
        pub branches: Mutex<Vec<String>>,
    }

    impl FakeScm {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SourceControl for FakeScm {
        async fn create_branch(&self, _repo: &Path, name: &str) -> Result<(), ScmError> {
            self.branches.lock().push(name.to_string());
            Ok(())
        }

        async fn create_worktree(
            &self,
            _repo: &Path,
            _path: &Path,
            branch: &str,
        ) -> Result<(), ScmError> {
            self.branches.lock().push(branch.to_string());
            Ok(())
        }

        async fn merge(
            &self,
            _repo: &Path,
            _source: &str,
            _target: &str,
        ) -> Result<MergeOutcome, ScmError> {
            Ok(MergeOutcome {
                success: true,
                conflicts: Vec::new(),
            })
        }
    }
}
