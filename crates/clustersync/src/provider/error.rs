use thiserror::Error;

use crate::context::ContextError;
use crate::error::{context_kind, git_kind, ErrorKind};
use crate::gitops::GitOpsError;
use crate::secrets::SecretError;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Invalid cluster key '{0}', expected <provider>+<cluster>")]
    InvalidClusterKey(String),

    #[error("Missing configuration for {cluster}: {message}")]
    MissingConfig { cluster: String, message: String },

    #[error("Unsupported GitOps type '{0}'")]
    UnsupportedType(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("Credential error: {0}")]
    Secret(#[from] SecretError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Cloud API error: {0}")]
    CloudApi(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cluster {0} is unreachable")]
    Unreachable(String),

    #[error("Conflict writing {0} persisted after {1} attempts")]
    Conflict(String, u32),

    #[error(transparent)]
    Git(#[from] GitOpsError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub(crate) fn missing(cluster: &str, message: impl Into<String>) -> Self {
        ProviderError::MissingConfig {
            cluster: cluster.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::InvalidClusterKey(_)
            | ProviderError::MissingConfig { .. }
            | ProviderError::UnsupportedType(_)
            | ProviderError::InvalidManifest(_)
            | ProviderError::Kubeconfig(_)
            | ProviderError::Secret(_) => ErrorKind::Configuration,
            ProviderError::Kube(e) if is_conflict(e) => ErrorKind::Conflict,
            ProviderError::Kube(_)
            | ProviderError::CloudApi(_)
            | ProviderError::Http(_)
            | ProviderError::Unreachable(_) => ErrorKind::Connectivity,
            ProviderError::Conflict(..) => ErrorKind::Conflict,
            ProviderError::Git(e) => git_kind(e),
            ProviderError::Context(e) => context_kind(e),
            ProviderError::Io(_) => ErrorKind::Storage,
        }
    }
}

/// HTTP status of a Kubernetes API error response, if it was one.
pub(crate) fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    api_status(err) == Some(409)
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    api_status(err) == Some(404)
}

pub type Result<T> = std::result::Result<T, ProviderError>;
