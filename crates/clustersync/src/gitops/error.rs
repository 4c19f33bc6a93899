//! Git engine error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while driving a local clone.
#[derive(Error, Debug)]
pub enum GitOpsError {
    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File operation failed: {0}")]
    FileOperation(String),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git push rejected: {0}")]
    GitPushRejected(String),

    #[error("Git merge conflict: {0}")]
    GitMergeConflict(String),

    #[error("Git repository not initialized")]
    GitNotInitialized,

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),
}

impl From<std::io::Error> for GitOpsError {
    fn from(err: std::io::Error) -> Self {
        GitOpsError::FileOperation(err.to_string())
    }
}

impl GitOpsError {
    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitOpsError::GitNetworkError(_) | GitOpsError::GitTimeout(_)
        )
    }

    /// Returns true if the error came from reaching the remote.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            GitOpsError::GitNetworkError(_)
                | GitOpsError::GitTimeout(_)
                | GitOpsError::GitPushRejected(_)
                | GitOpsError::GitAuthFailed(_)
        )
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> GitOpsError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return GitOpsError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("[rejected]")
        || lower.contains("failed to push some refs")
        || lower.contains("non-fast-forward")
    {
        return GitOpsError::GitPushRejected(stderr.trim().to_string());
    }

    if lower.contains("merge conflict") || (lower.contains("conflict") && lower.contains("merge")) {
        return GitOpsError::GitMergeConflict(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return GitOpsError::GitAuthFailed(stderr.trim().to_string());
    }

    GitOpsError::GitOperation(stderr.trim().to_string())
}

/// Result type for git engine operations.
pub type Result<T> = std::result::Result<T, GitOpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_error() {
        let err = classify_git_error("fatal: unable to access 'https://x/': Could not resolve host: x");
        assert!(matches!(err, GitOpsError::GitNetworkError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_push_rejected() {
        let err = classify_git_error(
            " ! [rejected]        main -> main (fetch first)\nerror: failed to push some refs",
        );
        assert!(matches!(err, GitOpsError::GitPushRejected(_)));
        assert!(!err.is_retryable());
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_classify_auth_error() {
        let err = classify_git_error("remote: Invalid username or password.\nfatal: Authentication failed");
        assert!(matches!(err, GitOpsError::GitAuthFailed(_)));
    }

    #[test]
    fn test_classify_generic() {
        let err = classify_git_error("fatal: pathspec 'x' did not match any files");
        assert!(matches!(err, GitOpsError::GitOperation(_)));
    }
}
