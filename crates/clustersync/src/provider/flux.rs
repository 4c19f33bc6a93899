//! Flux v2 provider.
//!
//! Resources travel like the plain git provider. `apply_config` also
//! commits the `GitRepository` and `Kustomization` that make Flux pull
//! `clusters/<cluster>/context/<cid>`. Status is read back from the
//! configured branch.

use serde_json::json;

use super::error::{ProviderError, Result};
use super::git::{load_bundle, GitProvider};
use super::lookup::{GitOpsConfig, SyncTimings};
use super::{ProviderEnv, SyncTarget};
use crate::gitops::ChangeSet;

const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta1";
const KUSTOMIZE_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1beta2";
const SOURCE_INTERVAL: &str = "30s";
const KUSTOMIZATION_INTERVAL: &str = "300s";

pub struct FluxProvider {
    git: GitProvider,
    timings: SyncTimings,
}

impl FluxProvider {
    pub async fn new(env: &ProviderEnv, target: SyncTarget, gitops: &GitOpsConfig) -> Result<Self> {
        let cluster = target.cluster.to_string();
        let timings = match &gitops.resource_object {
            Some(name) => SyncTimings::from_bundle(&cluster, &load_bundle(env, &target, name).await?)?,
            None => SyncTimings::default(),
        };

        let git = GitProvider::new(env, target, gitops).await?;
        let branch = git.branch().to_string();
        Ok(Self {
            git: git.with_status_branch(branch),
            timings,
        })
    }

    pub fn git(&self) -> &GitProvider {
        &self.git
    }

    fn cluster_dir(&self) -> String {
        format!("clusters/{}", self.git.target().cluster)
    }

    fn source_path(&self) -> String {
        format!("{}/{}.yaml", self.cluster_dir(), self.git.target().instance_id)
    }

    fn kustomization_path(&self) -> String {
        format!(
            "{}/kcust{}.yaml",
            self.cluster_dir(),
            self.git.target().instance_id
        )
    }

    /// The `GitRepository` and `Kustomization` documents, in commit order.
    pub fn agent_config(&self) -> Result<ChangeSet> {
        let target = self.git.target();
        let source_name = target.instance_id.clone();

        let source = json!({
            "apiVersion": SOURCE_API_VERSION,
            "kind": "GitRepository",
            "metadata": {
                "name": source_name,
                "namespace": target.namespace,
            },
            "spec": {
                "url": self.git.url(),
                "interval": SOURCE_INTERVAL,
                "ref": { "branch": self.git.branch() },
            },
        });

        let kustomization = json!({
            "apiVersion": KUSTOMIZE_API_VERSION,
            "kind": "Kustomization",
            "metadata": {
                "name": format!("kcust{}", target.instance_id),
                "namespace": target.namespace,
            },
            "spec": {
                "interval": KUSTOMIZATION_INTERVAL,
                "path": format!("{}/context/{}", self.cluster_dir(), target.instance_id),
                "prune": true,
                "timeout": format!("{}s", self.timings.timeout_secs),
                "retryInterval": format!("{}s", self.timings.retry_interval_secs),
                "sourceRef": {
                    "kind": "GitRepository",
                    "name": source_name,
                },
                "targetNamespace": target.namespace,
            },
        });

        let mut changes = ChangeSet::new();
        changes.add(self.source_path(), to_yaml(&source)?);
        changes.add(self.kustomization_path(), to_yaml(&kustomization)?);
        Ok(changes)
    }

    pub async fn apply_config(&self) -> Result<()> {
        let changes = self.agent_config()?;
        self.git.commit(&changes).await
    }

    pub async fn delete_config(&self) -> Result<()> {
        let mut changes = ChangeSet::new();
        changes.delete(self.source_path());
        changes.delete(self.kustomization_path());
        self.git.commit(&changes).await
    }
}

fn to_yaml(value: &serde_json::Value) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| ProviderError::InvalidManifest(e.to_string()))
}
