//! Chooses how one cluster is reached.

use tracing::instrument;

use super::anthos::AnthosProvider;
use super::azure_arc::AzureArcProvider;
use super::cluster_key::ClusterKey;
use super::error::{ProviderError, Result};
use super::flux::FluxProvider;
use super::git::GitProvider;
use super::kube::KubeProvider;
use super::lookup::GitOpsConfig;
use super::{ClusterSyncProvider, ProviderEnv, SyncTarget};

pub const GITOPS_TYPE_GIT: &str = "git";
pub const GITOPS_TYPE_FLUX: &str = "fluxcd";
pub const GITOPS_TYPE_ANTHOS: &str = "anthos";
pub const GITOPS_TYPE_AZURE_ARC: &str = "azureArcV2";

/// Builds the provider for `cluster_key` within one `(instance, app)`.
///
/// A stored kubeconfig wins over a GitOps record. Having neither is a
/// configuration error.
#[instrument(level = "debug", skip_all, fields(instance = %instance_id, app = %app, cluster = %cluster_key))]
pub async fn select_provider(
    env: &ProviderEnv,
    instance_id: &str,
    app: &str,
    cluster_key: &str,
    level: &str,
    namespace: &str,
) -> Result<ClusterSyncProvider> {
    let cluster = ClusterKey::parse(cluster_key)?;
    let target = SyncTarget::new(instance_id, app, cluster.clone(), level, namespace);

    let kubeconfig = env
        .cloud_configs
        .get_kubeconfig(&cluster.provider, &cluster.cluster, level, namespace)
        .await?
        .filter(|k| !k.trim().is_empty());
    if let Some(kubeconfig) = kubeconfig {
        log::debug!("Using direct access for {}", cluster);
        let provider = KubeProvider::new(env, target, &kubeconfig).await?;
        return Ok(ClusterSyncProvider::Kubernetes(provider));
    }

    let gitops = find_gitops_config(env, &cluster, level, namespace)
        .await?
        .ok_or_else(|| {
            ProviderError::missing(cluster_key, "no kubeconfig or GitOps configuration stored")
        })?;
    log::debug!("Using {} for {}", gitops.gitops_type, cluster);

    let provider = match gitops.gitops_type.as_str() {
        GITOPS_TYPE_GIT => ClusterSyncProvider::Git(GitProvider::new(env, target, &gitops).await?),
        GITOPS_TYPE_FLUX => ClusterSyncProvider::Flux(FluxProvider::new(env, target, &gitops).await?),
        GITOPS_TYPE_ANTHOS => {
            ClusterSyncProvider::Anthos(AnthosProvider::new(env, target, &gitops).await?)
        }
        GITOPS_TYPE_AZURE_ARC => {
            ClusterSyncProvider::AzureArc(AzureArcProvider::new(env, target, &gitops).await?)
        }
        other => return Err(ProviderError::UnsupportedType(other.to_string())),
    };
    Ok(provider)
}

/// Looks for a record at the deployment's own scope first, then at the
/// cluster-wide scope.
async fn find_gitops_config(
    env: &ProviderEnv,
    cluster: &ClusterKey,
    level: &str,
    namespace: &str,
) -> Result<Option<GitOpsConfig>> {
    let scoped = env
        .cloud_configs
        .get_gitops_config(&cluster.provider, &cluster.cluster, level, namespace)
        .await?;
    if scoped.is_some() || level == "0" {
        return Ok(scoped);
    }
    env.cloud_configs
        .get_gitops_config(&cluster.provider, &cluster.cluster, "0", "default")
        .await
}
