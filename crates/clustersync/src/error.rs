use std::path::PathBuf;
use thiserror::Error;

use crate::context::ContextError;
use crate::depend::DependError;
use crate::gitops::GitOpsError;
use crate::provider::ProviderError;

/// Coarse classification shared by every error the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing credentials, unknown provider type, malformed cluster key.
    Configuration,
    /// Cluster or repository unreachable, push rejected.
    Connectivity,
    /// Optimistic-concurrency clash that outlived its retries.
    Conflict,
    /// Malformed status report.
    StatusFormat,
    /// Desired-state tree or local filesystem failure.
    Storage,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Git error: {0}")]
    Git(#[from] GitOpsError),

    #[error("Dependency error: {0}")]
    Depend(#[from] DependError),

    #[error("Malformed status report: {0}")]
    StatusFormat(String),

    #[error("App '{app}' failed on cluster '{cluster}': {source}")]
    Cluster {
        app: String,
        cluster: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Instance {0} was cancelled")]
    Cancelled(String),
}

impl SyncError {
    /// Wraps an error with the (app, cluster) it happened on.
    pub fn on_cluster(app: &str, cluster: &str, source: impl Into<SyncError>) -> Self {
        SyncError::Cluster {
            app: app.to_string(),
            cluster: cluster.to_string(),
            source: Box::new(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) | SyncError::Depend(_) => ErrorKind::Configuration,
            SyncError::Context(e) => context_kind(e),
            SyncError::Provider(e) => e.kind(),
            SyncError::Git(e) => git_kind(e),
            SyncError::StatusFormat(_) => ErrorKind::StatusFormat,
            SyncError::Cluster { source, .. } => source.kind(),
            SyncError::Cancelled(_) => ErrorKind::Connectivity,
        }
    }

    /// True for conflicts and transient git network failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Git(e) => e.is_retryable(),
            SyncError::Provider(ProviderError::Git(e)) => e.is_retryable(),
            SyncError::Cluster { source, .. } => source.is_retryable(),
            other => other.kind() == ErrorKind::Conflict,
        }
    }
}

pub(crate) fn context_kind(err: &ContextError) -> ErrorKind {
    match err {
        ContextError::InvalidInstruction { .. } => ErrorKind::Configuration,
        _ => ErrorKind::Storage,
    }
}

pub(crate) fn git_kind(err: &GitOpsError) -> ErrorKind {
    match err {
        GitOpsError::WriteFile { .. } | GitOpsError::FileOperation(_) => ErrorKind::Storage,
        GitOpsError::InvalidPath(_) => ErrorKind::Configuration,
        GitOpsError::GitMergeConflict(_) => ErrorKind::Conflict,
        _ => ErrorKind::Connectivity,
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
