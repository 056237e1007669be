//! Branch lifecycle around an agent session: create a session branch, merge
//! it back with automatic conflict resolution, inspect and roll back.
//!
//! Every command and every output line is mirrored to the session's log
//! stream at `git` level.

pub mod branch;

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::{ConflictStrategy, RepositoryConfig},
    error::{AppError, Result},
    logs::{LogBroadcaster, LogLevel},
    process::{CommandSpec, ProcessOutcome, ProcessRunner},
};

/// One line of `git diff --name-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedFile {
    /// `A`, `M`, `D`, or `R`/`C` with a similarity score
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub created: i64,
    pub modified: i64,
    pub deleted: i64,
}

impl ChangeCounts {
    pub fn tally(files: &[ChangedFile]) -> Self {
        let mut counts = ChangeCounts::default();
        for file in files {
            match file.status.chars().next() {
                Some('A') | Some('C') => counts.created += 1,
                Some('D') => counts.deleted += 1,
                Some(_) => counts.modified += 1,
                None => {}
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub branch: String,
    pub into: String,
    /// Files whose conflicts were resolved in favour of the session branch
    pub resolved_conflicts: Vec<String>,
}

pub struct GitAutomation {
    config: RepositoryConfig,
    logs: LogBroadcaster,
}

impl GitAutomation {
    pub fn new(config: RepositoryConfig, logs: LogBroadcaster) -> Self {
        Self { config, logs }
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", &self.config.path)
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// Run git, logging the command and its output. Nonzero exit is not an error.
    async fn try_git(&self, session_id: &str, args: &[&str]) -> Result<ProcessOutcome> {
        let spec = self.spec(args);
        self.logs
            .send(session_id, LogLevel::Git, format!("Executing: {}", spec));
        let outcome = ProcessRunner::output(&spec, |line| {
            self.logs
                .send(session_id, LogLevel::Git, format!("  {}", line));
        })
        .await?;
        Ok(outcome)
    }

    /// Run git and fail with the captured output on nonzero exit.
    async fn git(&self, session_id: &str, args: &[&str]) -> Result<String> {
        let outcome = self.try_git(session_id, args).await?;
        if outcome.success() {
            return Ok(outcome.output);
        }
        let message = format!(
            "git {} failed with exit code {}",
            args.join(" "),
            outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        );
        self.logs.error(session_id, &message);
        Err(AppError::external_tool(message, outcome.output))
    }

    /// The configured default branch, or the fallback name if only that exists.
    pub async fn resolve_default_branch(&self, session_id: &str) -> Result<String> {
        for candidate in [&self.config.default_branch, &self.config.fallback_branch] {
            let reference = format!("refs/heads/{}", candidate);
            let outcome = self
                .try_git(session_id, &["rev-parse", "--verify", "--quiet", &reference])
                .await?;
            if outcome.success() {
                return Ok(candidate.clone());
            }
        }
        Err(AppError::InvalidState(format!(
            "Repository {} has neither '{}' nor '{}'",
            self.config.path.display(),
            self.config.default_branch,
            self.config.fallback_branch
        )))
    }

    /// Best-effort update of `branch` from the configured remote.
    async fn pull(&self, session_id: &str, branch: &str) -> Result<()> {
        let outcome = self
            .try_git(session_id, &["pull", &self.config.remote, branch])
            .await?;
        if !outcome.success() {
            warn!(session_id = %session_id, branch = %branch, "Pull failed, continuing with local state");
            self.logs
                .send(session_id, LogLevel::Git, "Pull failed, continuing with local state");
        }
        Ok(())
    }

    /// Create and switch to `<prefix>/<slug>-<timestamp>` off the default branch.
    ///
    /// The default and fallback branches are tried in turn. When neither can
    /// be checked out (missing, or blocked by local changes) the new branch
    /// starts from whatever is checked out.
    pub async fn create_branch(&self, session_id: &str, description: &str) -> Result<String> {
        let mut base = None;
        for candidate in [&self.config.default_branch, &self.config.fallback_branch] {
            if self.try_git(session_id, &["checkout", candidate]).await?.success() {
                self.pull(session_id, candidate).await?;
                base = Some(candidate.clone());
                break;
            }
        }
        let base = match base {
            Some(base) => base,
            None => {
                let current = self.get_current_branch(session_id).await?;
                warn!(session_id = %session_id, "Could not check out a default branch, branching from {}", current);
                self.logs.send(
                    session_id,
                    LogLevel::Git,
                    format!("Could not check out a default branch, branching from {}", current),
                );
                current
            }
        };

        let branch = branch::branch_name(&self.config.branch_prefix, description, Local::now());
        self.git(session_id, &["checkout", "-b", &branch]).await?;

        info!(session_id = %session_id, branch = %branch, base = %base, "Created session branch");
        Ok(branch)
    }

    /// Merge `branch` into the default branch with `--no-ff` and delete it.
    ///
    /// Uncommitted work on the branch is committed first. Conflicts are
    /// handled per `strategy`.
    pub async fn merge_branch(
        &self,
        session_id: &str,
        branch: &str,
        message: &str,
        strategy: ConflictStrategy,
    ) -> Result<MergeOutcome> {
        self.git(session_id, &["checkout", branch]).await?;

        let status = self.git(session_id, &["status", "--porcelain"]).await?;
        if !status.trim().is_empty() {
            self.git(session_id, &["add", "-A"]).await?;
            let commit_message = format!("Final changes before merge - Session: {}", session_id);
            self.git(session_id, &["commit", "-m", &commit_message])
                .await?;
        }

        let target = self.resolve_default_branch(session_id).await?;
        self.git(session_id, &["checkout", &target]).await?;
        self.pull(session_id, &target).await?;

        let merge = self
            .try_git(session_id, &["merge", "--no-ff", "-m", message, branch])
            .await?;

        let mut resolved_conflicts = Vec::new();
        if !merge.success() {
            let conflicts = self.conflicted_files(session_id).await?;
            if conflicts.is_empty() {
                self.abort_merge(session_id).await;
                return Err(AppError::external_tool(
                    format!("git merge of {} failed", branch),
                    merge.output,
                ));
            }

            match strategy {
                ConflictStrategy::Abort => {
                    self.abort_merge(session_id).await;
                    self.logs.error(
                        session_id,
                        format!("Merge aborted, conflicts in: {}", conflicts.join(", ")),
                    );
                    return Err(AppError::MergeConflict { files: conflicts });
                }
                ConflictStrategy::Theirs => {
                    self.resolve_with_theirs(session_id, &conflicts).await?;
                    let resolved_message = format!("{} (with auto-resolved conflicts)", message);
                    self.git(session_id, &["commit", "-m", &resolved_message])
                        .await?;
                    resolved_conflicts = conflicts;
                }
            }
        }

        self.git(session_id, &["branch", "-d", branch]).await?;
        info!(
            session_id = %session_id,
            branch = %branch,
            into = %target,
            conflicts = resolved_conflicts.len(),
            "Merged session branch"
        );

        Ok(MergeOutcome {
            branch: branch.to_string(),
            into: target,
            resolved_conflicts,
        })
    }

    async fn conflicted_files(&self, session_id: &str) -> Result<Vec<String>> {
        let output = self
            .git(session_id, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Take the incoming branch's side of each file, including deletions.
    async fn resolve_with_theirs(&self, session_id: &str, files: &[String]) -> Result<()> {
        for file in files {
            let checkout = self
                .try_git(session_id, &["checkout", "--theirs", "--", file])
                .await?;
            if checkout.success() {
                self.git(session_id, &["add", "--", file]).await?;
            } else {
                self.git(session_id, &["rm", "--quiet", "--", file]).await?;
            }
            self.logs
                .send(session_id, LogLevel::Git, format!("Resolved conflict: {}", file));
        }
        self.git(session_id, &["add", "-A"]).await?;
        Ok(())
    }

    async fn abort_merge(&self, session_id: &str) {
        match self.try_git(session_id, &["merge", "--abort"]).await {
            Ok(outcome) if outcome.success() => {}
            _ => warn!(session_id = %session_id, "git merge --abort did not complete"),
        }
    }

    /// Full diff of `branch` against the point it forked from the default branch
    pub async fn get_diff(&self, session_id: &str, branch: &str) -> Result<String> {
        let base = self.resolve_default_branch(session_id).await?;
        let range = format!("{}...{}", base, branch);
        self.git(session_id, &["diff", &range]).await
    }

    pub async fn get_changed_files(
        &self,
        session_id: &str,
        branch: &str,
    ) -> Result<Vec<ChangedFile>> {
        let base = self.resolve_default_branch(session_id).await?;
        let range = format!("{}...{}", base, branch);
        let output = self
            .git(session_id, &["diff", "--name-status", &range])
            .await?;
        Ok(parse_name_status(&output))
    }

    /// Hard reset of the working tree and current branch to `commit_ref`
    pub async fn rollback(&self, session_id: &str, commit_ref: &str) -> Result<()> {
        self.git(session_id, &["reset", "--hard", commit_ref])
            .await?;
        info!(session_id = %session_id, commit_ref = %commit_ref, "Rolled back");
        Ok(())
    }

    /// Force-delete `branch` after switching to the default branch
    pub async fn delete_branch(&self, session_id: &str, branch: &str) -> Result<()> {
        let base = self.resolve_default_branch(session_id).await?;
        self.git(session_id, &["checkout", &base]).await?;
        self.git(session_id, &["branch", "-D", branch]).await?;
        Ok(())
    }

    pub async fn get_current_branch(&self, session_id: &str) -> Result<String> {
        let output = self
            .git(session_id, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(output.trim().to_string())
    }
}

/// Parse `git diff --name-status` output. Renames and copies report the new path.
pub fn parse_name_status(output: &str) -> Vec<ChangedFile> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let status = parts.next()?.trim();
            let path = parts.last()?.trim();
            if status.is_empty() || path.is_empty() {
                return None;
            }
            Some(ChangedFile {
                status: status.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}
