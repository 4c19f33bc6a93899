//! Local clone management for one remote repository.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;
use tracing::instrument;

use super::auth::build_auth_env;
use super::parse::{
    first_line, format_git_error, is_missing_remote_ref, parse_remote_head, parse_tree_paths,
};
use super::types::{ChangeSet, CommitOutcome, FileOp, GitRemote, GitSettings, PullOutcome};
use crate::gitops::error::{classify_git_error, GitOpsError, Result};

/// Serializes every operation on one local clone of a remote repository.
///
/// The engine owns the working tree: callers never touch it directly. Writes
/// go through [`commit_files`](Self::commit_files), reads through
/// [`pull_and_diff`](Self::pull_and_diff). Each call holds the engine lock
/// for its whole duration.
pub struct GitRepositoryEngine {
    remote: GitRemote,
    repo_path: PathBuf,
    settings: GitSettings,
    lock: Mutex<()>,
}

impl GitRepositoryEngine {
    pub fn new(remote: GitRemote, repo_path: impl Into<PathBuf>, settings: GitSettings) -> Self {
        Self {
            remote,
            repo_path: repo_path.into(),
            settings,
            lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn remote(&self) -> &GitRemote {
        &self.remote
    }

    pub fn is_git_repo(&self) -> bool {
        self.repo_path.join(".git").exists()
    }

    /// Clones the remote into the working directory unless a clone is already there.
    pub async fn ensure_clone(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.ensure_clone_locked().await
    }

    /// Writes `changes` on `branch`, commits them with `message` and pushes.
    ///
    /// The branch is taken from the remote when it exists there, otherwise it
    /// is created from the remote's default branch. A batch that leaves the
    /// tree unchanged produces no commit and no push. A failed push is
    /// reported, not retried; the next batch starts again from the remote tip.
    #[instrument(level = "debug", skip_all, fields(repo = %self.remote.repo, branch = %branch, files = changes.len()))]
    pub async fn commit_files(
        &self,
        branch: &str,
        message: &str,
        changes: &ChangeSet,
    ) -> Result<CommitOutcome> {
        if changes.is_empty() {
            return Ok(nothing_to_commit());
        }

        let _guard = self.lock.lock().await;
        self.ensure_clone_locked().await?;
        self.checkout_for_write(branch).await?;

        for file in changes.iter() {
            match file.op {
                FileOp::Add(content) => self.stage_file(&file.path, &content)?,
                FileOp::Delete => self.unstage_file(&file.path)?,
            }
        }

        if !self.has_staged_changes()? {
            log::debug!(
                "Batch for {}/{} on {} left the tree unchanged",
                self.remote.user,
                self.remote.repo,
                branch
            );
            return Ok(nothing_to_commit());
        }

        let output = self.run_git(&["commit", "-q", "-m", message])?;
        if !output.status.success() {
            return Err(GitOpsError::GitOperation(format_git_error(&output)));
        }

        let commit_id = self.rev_parse("HEAD")?;

        let refspec = format!("HEAD:refs/heads/{}", branch);
        let output = self
            .run_remote(&self.repo_path, &["push", "-q", "origin", &refspec])
            .await?;
        if !output.status.success() {
            return Err(classify_git_error(&String::from_utf8_lossy(&output.stderr)));
        }

        log::info!(
            "Pushed {} to {}/{} ({})",
            short(&commit_id),
            self.remote.user,
            self.remote.repo,
            branch
        );

        Ok(CommitOutcome {
            message: message.to_string(),
            commit_id: Some(commit_id),
        })
    }

    /// Fetches `branch` and, if its tip moved past `last_seen`, returns the
    /// first file (in path order) under `path`.
    ///
    /// Reads go straight to the fetched tree so the working tree used for
    /// writes is never disturbed. A branch that does not exist on the remote
    /// yet yields an empty outcome.
    #[instrument(level = "debug", skip_all, fields(repo = %self.remote.repo, branch = %branch))]
    pub async fn pull_and_diff(
        &self,
        branch: &str,
        path: &str,
        last_seen: Option<&str>,
    ) -> Result<PullOutcome> {
        let _guard = self.lock.lock().await;
        self.ensure_clone_locked().await?;

        let output = self
            .run_remote(&self.repo_path, &["fetch", "-q", "origin", branch])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_remote_ref(&stderr) {
                return Ok(PullOutcome::default());
            }
            return Err(classify_git_error(&stderr));
        }

        let tip = self.rev_parse("FETCH_HEAD")?;
        if last_seen == Some(tip.as_str()) {
            return Ok(PullOutcome {
                commit_id: Some(tip),
                changed: false,
                document: None,
            });
        }

        let pathspec = path.trim_end_matches('/');
        let output = self.run_git(&["ls-tree", "-r", "--name-only", &tip, "--", pathspec])?;
        if !output.status.success() {
            return Err(GitOpsError::GitOperation(format_git_error(&output)));
        }

        let document = match parse_tree_paths(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .next()
        {
            Some(file) => {
                let output = self.run_git(&["show", &format!("{}:{}", tip, file)])?;
                if !output.status.success() {
                    return Err(GitOpsError::GitOperation(format_git_error(&output)));
                }
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            None => None,
        };

        Ok(PullOutcome {
            commit_id: Some(tip),
            changed: true,
            document,
        })
    }

    /// Writes a file into the working tree and adds it to the index.
    pub fn stage_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content).map_err(|source| GitOpsError::WriteFile {
            path: full.clone(),
            source,
        })?;

        let output = self.run_git(&["add", "--", path])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GitOpsError::GitOperation(format_git_error(&output)))
        }
    }

    /// Removes a file from the working tree and the index. Missing files are fine.
    pub fn unstage_file(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let output = self.run_git(&["rm", "-q", "--cached", "--ignore-unmatch", "--", path])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GitOpsError::GitOperation(format_git_error(&output)))
        }
    }

    // ─── Private helpers ───

    async fn ensure_clone_locked(&self) -> Result<()> {
        if self.is_git_repo() {
            return Ok(());
        }

        if self.repo_path.exists() && std::fs::read_dir(&self.repo_path)?.next().is_some() {
            return Err(GitOpsError::InvalidPath(format!(
                "{} exists and is not a git repository",
                self.repo_path.display()
            )));
        }

        let parent = self
            .repo_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let target = self.repo_path.to_str().ok_or_else(|| {
            GitOpsError::InvalidPath(format!(
                "non-UTF8 clone path {}",
                self.repo_path.display()
            ))
        })?;

        log::info!(
            "Cloning {}/{} into {}",
            self.remote.user,
            self.remote.repo,
            self.repo_path.display()
        );

        let output = self
            .run_remote(&parent, &["clone", "-q", &self.remote.url, target])
            .await?;
        if !output.status.success() {
            return Err(classify_git_error(&String::from_utf8_lossy(&output.stderr)));
        }

        let email = format!("{}@{}", self.remote.user, self.settings.user_email_domain);
        for (key, value) in [
            ("user.name", self.remote.user.as_str()),
            ("user.email", email.as_str()),
        ] {
            let output = self.run_git(&["config", key, value])?;
            if !output.status.success() {
                return Err(GitOpsError::GitOperation(format_git_error(&output)));
            }
        }

        Ok(())
    }

    async fn checkout_for_write(&self, branch: &str) -> Result<()> {
        let output = self
            .run_remote(&self.repo_path, &["fetch", "-q", "--prune", "origin"])
            .await?;
        if !output.status.success() {
            return Err(classify_git_error(&String::from_utf8_lossy(&output.stderr)));
        }

        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let local_ref = format!("refs/heads/{}", branch);

        let output = if self.ref_exists(&remote_ref)? {
            self.run_git(&["checkout", "-q", "-f", "-B", branch, &remote_ref])?
        } else if self.ref_exists(&local_ref)? {
            self.run_git(&["checkout", "-q", "-f", branch])?
        } else if let Some(start) = self.default_start_point()? {
            log::debug!("Creating branch {} from {}", branch, start);
            self.run_git(&["checkout", "-q", "-f", "-b", branch, &start])?
        } else {
            // Empty remote: start an unborn branch with an empty index.
            let output = self.run_git(&["symbolic-ref", "HEAD", &local_ref])?;
            if !output.status.success() {
                return Err(GitOpsError::GitOperation(format_git_error(&output)));
            }
            self.run_git(&["rm", "-r", "-q", "--cached", "--ignore-unmatch", "."])?
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(GitOpsError::GitOperation(format_git_error(&output)))
        }
    }

    /// The remote HEAD if the clone recorded one, else the configured branch.
    fn default_start_point(&self) -> Result<Option<String>> {
        let output = self.run_git(&["symbolic-ref", "-q", "refs/remotes/origin/HEAD"])?;
        if output.status.success() {
            if let Some(branch) = first_line(&output).as_deref().and_then(parse_remote_head) {
                let candidate = format!("refs/remotes/origin/{}", branch);
                if self.ref_exists(&candidate)? {
                    return Ok(Some(candidate));
                }
            }
        }

        let configured = format!("refs/remotes/origin/{}", self.remote.branch);
        if self.ref_exists(&configured)? {
            return Ok(Some(configured));
        }
        Ok(None)
    }

    fn ref_exists(&self, reference: &str) -> Result<bool> {
        let output = self.run_git(&["rev-parse", "-q", "--verify", reference])?;
        Ok(output.status.success())
    }

    fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = self.run_git(&["rev-parse", rev])?;
        if !output.status.success() {
            return Err(GitOpsError::GitOperation(format_git_error(&output)));
        }
        first_line(&output)
            .ok_or_else(|| GitOpsError::GitOperation(format!("rev-parse {} printed nothing", rev)))
    }

    fn has_staged_changes(&self) -> Result<bool> {
        let output = self.run_git(&["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitOpsError::GitOperation(format_git_error(&output))),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(GitOpsError::InvalidPath(path.to_string()));
        }
        Ok(self.repo_path.join(relative))
    }

    /// Runs a local git command in the repository directory.
    fn run_git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .current_dir(&self.repo_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GitOpsError::GitOperation(e.to_string()))
    }

    /// Runs a git command that talks to the remote, with credentials and a deadline.
    async fn run_remote(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let auth = build_auth_env(&self.remote.user, self.remote.token.as_ref())?;

        let mut cmd = TokioCommand::new("git");
        cmd.current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &auth.env_vars {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| GitOpsError::GitOperation(e.to_string()))?;

        let deadline = Duration::from_secs(self.settings.timeout_secs);
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| GitOpsError::GitOperation(e.to_string()))?,
            Err(_) => return Err(GitOpsError::GitTimeout(self.settings.timeout_secs)),
        };

        drop(auth);
        Ok(output)
    }
}

fn nothing_to_commit() -> CommitOutcome {
    CommitOutcome {
        message: "Nothing to commit".to_string(),
        commit_id: None,
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
