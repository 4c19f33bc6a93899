//! Data types shared by the git engine and the providers that drive it.

use std::collections::BTreeMap;
use std::fmt;

use secrecy::SecretString;

/// Connection details for one remote repository.
#[derive(Clone)]
pub struct GitRemote {
    pub url: String,
    pub user: String,
    pub repo: String,
    pub branch: String,
    pub token: Option<SecretString>,
}

impl fmt::Debug for GitRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitRemote")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Engine-wide git knobs.
#[derive(Debug, Clone)]
pub struct GitSettings {
    /// Commit author emails are `<user>@<domain>`.
    pub user_email_domain: String,
    /// Upper bound for a single remote command, in seconds.
    pub timeout_secs: u64,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            user_email_domain: "gmail.com".to_string(),
            timeout_secs: 120,
        }
    }
}

/// What to do with one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Add(String),
    Delete,
}

/// One pending change in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFile {
    pub path: String,
    pub op: FileOp,
}

/// A batch of file changes committed together.
///
/// A later change for the same path replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    files: BTreeMap<String, FileOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), FileOp::Add(content.into()));
    }

    pub fn delete(&mut self, path: impl Into<String>) {
        self.files.insert(path.into(), FileOp::Delete);
    }

    pub fn push(&mut self, file: CommitFile) {
        self.files.insert(file.path, file.op);
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.files.extend(other.files);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileOp> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = CommitFile> + '_ {
        self.files.iter().map(|(path, op)| CommitFile {
            path: path.clone(),
            op: op.clone(),
        })
    }
}

/// Result of committing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub message: String,
    /// None when the batch produced no change.
    pub commit_id: Option<String>,
}

/// Result of polling a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Tip of the remote branch; None if the branch does not exist yet.
    pub commit_id: Option<String>,
    /// True when the tip differs from the last one seen.
    pub changed: bool,
    /// Content of the first file under the requested path, if the tip changed.
    pub document: Option<String>,
}
