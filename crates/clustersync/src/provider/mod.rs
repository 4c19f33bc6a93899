//! Cluster sync providers.
//!
//! A provider knows how to push resources to one cluster and how to read
//! their status back. Clusters with a stored kubeconfig are written
//! directly; the others go through a git repository that an in-cluster
//! agent reconciles (plain git, Flux, Anthos Config Sync, Azure Arc).

pub mod anthos;
pub mod azure_arc;
pub mod cluster_key;
pub mod error;
pub mod flux;
pub mod git;
pub mod kube;
pub mod lookup;
pub mod selector;
pub mod tag;

use std::sync::Arc;

use serde_json::json;

use crate::config::EngineConfig;
use crate::context::{ContextStore, LogicalCloudInfo};
use crate::gitops::{ChangeSet, GitEngineRegistry, WatchSupervisor};
use crate::readiness::{ReadinessEngine, STATUS_API_VERSION, STATUS_KIND};

pub use anthos::AnthosProvider;
pub use azure_arc::{ArmClient, AzureArcProvider};
pub use cluster_key::ClusterKey;
pub use error::{ProviderError, Result};
pub use flux::FluxProvider;
pub use git::GitProvider;
pub use self::kube::KubeProvider;
pub use lookup::{CloudConfigStore, GitOpsConfig, KvBundle, MemoryCloudConfigStore, SyncTimings};
pub use selector::select_provider;

/// Namespace of status CRs written straight to a cluster.
pub const STATUS_NAMESPACE: &str = "default";

/// Shared collaborators every provider is built from.
#[derive(Clone)]
pub struct ProviderEnv {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn ContextStore>,
    pub cloud_configs: Arc<dyn CloudConfigStore>,
    pub git_engines: Arc<GitEngineRegistry>,
    /// Absent when the HTTP client could not be built; Azure Arc clusters
    /// then fail to construct.
    pub arm: Option<Arc<ArmClient>>,
}

/// The `(instance, app, cluster)` a provider works for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub instance_id: String,
    pub app: String,
    pub cluster: ClusterKey,
    /// Logical-cloud level, "0" for cluster-wide deployments.
    pub level: String,
    pub namespace: String,
}

impl SyncTarget {
    pub fn new(
        instance_id: impl Into<String>,
        app: impl Into<String>,
        cluster: ClusterKey,
        level: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            app: app.into(),
            cluster,
            level: level.into(),
            namespace: namespace.into(),
        }
    }

    /// `<cid>-<app>`; also the deployment label value of every resource.
    pub fn status_cr_name(&self) -> String {
        format!("{}-{}", self.instance_id, self.app)
    }
}

/// The status CR the cluster monitor fills in for this target.
pub fn status_cr_manifest(target: &SyncTarget, config: &EngineConfig) -> Result<String> {
    let name = target.status_cr_name();
    let document = json!({
        "apiVersion": STATUS_API_VERSION,
        "kind": STATUS_KIND,
        "metadata": {
            "name": name,
            "namespace": STATUS_NAMESPACE,
            "labels": { config.instance_label.as_str(): name },
        },
        "spec": {
            "selector": {
                "matchLabels": { config.deployment_label.as_str(): name },
            },
        },
    });
    serde_yaml::to_string(&document).map_err(|e| ProviderError::InvalidManifest(e.to_string()))
}

enum Transport<'a> {
    Direct(&'a KubeProvider),
    Git(&'a GitProvider),
}

/// One cluster's provider, resolved once by [`select_provider`].
pub enum ClusterSyncProvider {
    Kubernetes(KubeProvider),
    Git(GitProvider),
    Flux(FluxProvider),
    Anthos(AnthosProvider),
    AzureArc(AzureArcProvider),
}

impl ClusterSyncProvider {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Kubernetes(_) => "kubernetes",
            Self::Git(_) => selector::GITOPS_TYPE_GIT,
            Self::Flux(_) => selector::GITOPS_TYPE_FLUX,
            Self::Anthos(_) => selector::GITOPS_TYPE_ANTHOS,
            Self::AzureArc(_) => selector::GITOPS_TYPE_AZURE_ARC,
        }
    }

    fn transport(&self) -> Transport<'_> {
        match self {
            Self::Kubernetes(k) => Transport::Direct(k),
            Self::Git(g) => Transport::Git(g),
            Self::Flux(f) => Transport::Git(f.git()),
            Self::Anthos(a) => Transport::Git(a.git()),
            Self::AzureArc(a) => Transport::Git(a.git()),
        }
    }

    pub fn target(&self) -> &SyncTarget {
        match self.transport() {
            Transport::Direct(k) => k.target(),
            Transport::Git(g) => g.target(),
        }
    }

    pub fn as_kube(&self) -> Option<&KubeProvider> {
        match self {
            Self::Kubernetes(k) => Some(k),
            _ => None,
        }
    }

    pub async fn create(&self, name: &str, changes: ChangeSet, content: &str) -> Result<ChangeSet> {
        self.apply(name, changes, content).await
    }

    /// Applies the resource right away (direct) or stages it in `changes`.
    pub async fn apply(&self, name: &str, changes: ChangeSet, content: &str) -> Result<ChangeSet> {
        match self.transport() {
            Transport::Direct(k) => {
                k.apply(name, content).await?;
                Ok(changes)
            }
            Transport::Git(g) => Ok(g.stage(name, changes, content)),
        }
    }

    pub async fn delete(&self, name: &str, changes: ChangeSet, content: &str) -> Result<ChangeSet> {
        match self.transport() {
            Transport::Direct(k) => {
                k.delete(name, content).await?;
                Ok(changes)
            }
            Transport::Git(g) => Ok(g.unstage(name, changes)),
        }
    }

    /// Pushes staged changes. Direct writes are already applied.
    pub async fn commit(&self, changes: ChangeSet) -> Result<()> {
        match self.transport() {
            Transport::Direct(_) => Ok(()),
            Transport::Git(g) => g.commit(&changes).await,
        }
    }

    /// Installs the in-cluster agent configuration, if the variant has one.
    pub async fn apply_config(&self, logical_cloud: &LogicalCloudInfo) -> Result<()> {
        match self {
            Self::Kubernetes(_) | Self::Git(_) => Ok(()),
            Self::Flux(f) => f.apply_config().await,
            Self::Anthos(a) => a.apply_config(logical_cloud).await,
            Self::AzureArc(a) => a.apply_config().await,
        }
    }

    pub async fn delete_config(&self, logical_cloud: &LogicalCloudInfo) -> Result<()> {
        match self {
            Self::Kubernetes(_) | Self::Git(_) => Ok(()),
            Self::Flux(f) => f.delete_config().await,
            Self::Anthos(a) => a.delete_config(logical_cloud).await,
            Self::AzureArc(a) => a.delete_config().await,
        }
    }

    /// Returns false when a watch for this target is already running.
    pub fn start_cluster_watcher(
        &self,
        supervisor: &WatchSupervisor,
        readiness: Arc<ReadinessEngine>,
    ) -> bool {
        match self.transport() {
            Transport::Direct(k) => k.start_cluster_watcher(supervisor, readiness),
            Transport::Git(g) => g.start_cluster_watcher(supervisor, readiness),
        }
    }

    pub async fn apply_status_cr(&self, name: &str, content: &str) -> Result<()> {
        if let Self::Anthos(a) = self {
            return a.apply_status_cr(name, content).await;
        }
        match self.transport() {
            Transport::Direct(k) => k.apply_status_cr(name, content).await,
            Transport::Git(g) => g.apply_status_cr(name, content).await,
        }
    }

    pub async fn delete_status_cr(&self, name: &str) -> Result<()> {
        match self.transport() {
            Transport::Direct(k) => k.delete_status_cr(name).await,
            Transport::Git(g) => g.delete_status_cr(name).await,
        }
    }

    /// Git-backed clusters are only reached through their agent, so they
    /// always count as reachable.
    pub async fn is_reachable(&self) -> Result<()> {
        match self.transport() {
            Transport::Direct(k) => k.is_reachable().await,
            Transport::Git(_) => Ok(()),
        }
    }

    pub fn tag_resource(&self, content: &str, label: &str) -> Result<String> {
        match self.transport() {
            Transport::Direct(k) => k.tag_resource(content, label),
            Transport::Git(g) => g.tag_resource(content, label),
        }
    }

    /// Releases local state such as the temporary kubeconfig.
    pub fn clean_client_provider(&self) {
        if let Transport::Direct(k) = self.transport() {
            k.clean_client_provider();
        }
    }
}
