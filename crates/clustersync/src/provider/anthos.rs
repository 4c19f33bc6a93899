//! Anthos Config Sync provider.
//!
//! Namespace-scoped deployments (level other than "0") live under
//! `namespaces/<namespace>/<cluster>/` so that one `RepoSync` per logical
//! cloud can pick them up.

use serde_json::{json, Value};

use super::error::{ProviderError, Result};
use super::git::GitProvider;
use super::lookup::GitOpsConfig;
use super::{ProviderEnv, SyncTarget};
use crate::context::LogicalCloudInfo;
use crate::gitops::ChangeSet;

const REPO_SYNC_API_VERSION: &str = "configsync.gke.io/v1beta1";

pub struct AnthosProvider {
    git: GitProvider,
}

impl AnthosProvider {
    pub async fn new(env: &ProviderEnv, target: SyncTarget, gitops: &GitOpsConfig) -> Result<Self> {
        let base_dir = if target.level == "0" {
            format!("clusters/{}", target.cluster)
        } else {
            format!("namespaces/{}/{}", target.namespace, target.cluster)
        };
        let git = GitProvider::new(env, target, gitops).await?;
        Ok(Self {
            git: git.with_base_dir(base_dir),
        })
    }

    pub fn git(&self) -> &GitProvider {
        &self.git
    }

    fn repo_sync_name(logical_cloud: &LogicalCloudInfo) -> String {
        format!("repo-sync-{}", logical_cloud.name)
    }

    fn repo_sync_path(&self, logical_cloud: &LogicalCloudInfo) -> String {
        format!(
            "{}{}+RepoSync.json",
            self.git.path("context"),
            Self::repo_sync_name(logical_cloud)
        )
    }

    /// `<base>/context/<cid>/deployed`
    fn deployed_marker_path(&self) -> String {
        format!("{}/deployed", self.git.instance_dir("context"))
    }

    /// The `RepoSync` of a namespace-level logical cloud.
    pub fn repo_sync(&self, logical_cloud: &LogicalCloudInfo) -> Value {
        json!({
            "apiVersion": REPO_SYNC_API_VERSION,
            "kind": "RepoSync",
            "metadata": {
                "name": Self::repo_sync_name(logical_cloud),
                "namespace": logical_cloud.namespace,
            },
            "spec": {
                "git": {
                    "repo": self.git.url(),
                    "revision": "HEAD",
                    "branch": self.git.branch(),
                    "dir": format!("/namespaces/{}/{}", logical_cloud.namespace, self.git.target().cluster),
                    "auth": "none",
                    "noSSLVerify": false,
                },
            },
        })
    }

    /// Commits the `RepoSync` (level "1" logical clouds only) together with
    /// a `deployed` marker carrying the current time.
    pub async fn apply_config(&self, logical_cloud: &LogicalCloudInfo) -> Result<()> {
        let mut changes = ChangeSet::new();
        if logical_cloud.level == "1" {
            let document = serde_json::to_string(&self.repo_sync(logical_cloud))
                .map_err(|e| ProviderError::InvalidManifest(e.to_string()))?;
            changes.add(self.repo_sync_path(logical_cloud), document);
        }
        changes.add(self.deployed_marker_path(), chrono::Utc::now().to_rfc3339());
        self.git.commit(&changes).await
    }

    pub async fn delete_config(&self, logical_cloud: &LogicalCloudInfo) -> Result<()> {
        if logical_cloud.level != "1" {
            return Ok(());
        }
        let mut changes = ChangeSet::new();
        changes.delete(self.repo_sync_path(logical_cloud));
        self.git.commit(&changes).await
    }

    /// Config Sync rejects objects that carry a `status`, so it is dropped
    /// and the CR is pinned to the deployment namespace.
    pub async fn apply_status_cr(&self, name: &str, content: &str) -> Result<()> {
        let stripped = strip_status(content, &self.git.target().namespace)?;
        self.git.apply_status_cr(name, &stripped).await
    }
}

fn strip_status(content: &str, namespace: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(content)
        .map_err(|e| ProviderError::InvalidManifest(e.to_string()))?;
    let root = doc
        .as_object_mut()
        .ok_or_else(|| ProviderError::InvalidManifest("status CR is not a mapping".to_string()))?;
    root.remove("status");
    if !namespace.is_empty() {
        if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
            metadata.insert("namespace".to_string(), Value::from(namespace));
        }
    }
    serde_json::to_string(&doc).map_err(|e| ProviderError::InvalidManifest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::git_env;
    use crate::provider::ClusterKey;

    fn target(level: &str) -> SyncTarget {
        SyncTarget::new("42", "web", ClusterKey::new("edge", "c1"), level, "team-a")
    }

    fn logical_cloud(level: &str) -> LogicalCloudInfo {
        LogicalCloudInfo {
            name: "lc1".to_string(),
            namespace: "team-a".to_string(),
            level: level.to_string(),
        }
    }

    #[tokio::test]
    async fn test_paths_follow_level() {
        let fx = git_env(&[]).await;
        let gitops = GitOpsConfig::new("anthos", "gitref");

        let cluster_wide = AnthosProvider::new(&fx.env, target("0"), &gitops).await.unwrap();
        assert_eq!(
            cluster_wide.git().path("context"),
            "clusters/edge+c1/context/42/app/web/"
        );
        assert_eq!(
            cluster_wide.deployed_marker_path(),
            "clusters/edge+c1/context/42/deployed"
        );

        let scoped = AnthosProvider::new(&fx.env, target("1"), &gitops).await.unwrap();
        assert_eq!(
            scoped.git().resource_path("svc"),
            "namespaces/team-a/edge+c1/context/42/app/web/svc.yaml"
        );
        assert_eq!(
            scoped.repo_sync_path(&logical_cloud("1")),
            "namespaces/team-a/edge+c1/context/42/app/web/repo-sync-lc1+RepoSync.json"
        );
    }

    #[tokio::test]
    async fn test_repo_sync_document() {
        let fx = git_env(&[]).await;
        let provider = AnthosProvider::new(&fx.env, target("1"), &GitOpsConfig::new("anthos", "gitref"))
            .await
            .unwrap();
        let rs = provider.repo_sync(&logical_cloud("1"));
        assert_eq!(rs["metadata"]["name"], "repo-sync-lc1");
        assert_eq!(rs["metadata"]["namespace"], "team-a");
        assert_eq!(rs["spec"]["git"]["dir"], "/namespaces/team-a/edge+c1");
        assert_eq!(rs["spec"]["git"]["branch"], "main");
    }

    #[tokio::test]
    async fn test_apply_config_commits_marker_and_repo_sync() {
        let fx = git_env(&[]).await;
        let provider = AnthosProvider::new(&fx.env, target("1"), &GitOpsConfig::new("anthos", "gitref"))
            .await
            .unwrap();
        provider.apply_config(&logical_cloud("1")).await.unwrap();

        let out = std::process::Command::new("git")
            .args(["ls-tree", "-r", "--name-only", "main"])
            .current_dir(&fx.remote)
            .output()
            .unwrap();
        let files = String::from_utf8_lossy(&out.stdout);
        assert!(files.contains("namespaces/team-a/edge+c1/context/42/deployed"));
        assert!(files.contains("repo-sync-lc1+RepoSync.json"));
    }

    #[test]
    fn test_strip_status() {
        let cr = "apiVersion: k8splugin.io/v1alpha1\nkind: ResourceBundleState\nmetadata:\n  name: 42-web\nstatus:\n  ready: false\n";
        let out: Value = serde_json::from_str(&strip_status(cr, "team-a").unwrap()).unwrap();
        assert!(out.get("status").is_none());
        assert_eq!(out["metadata"]["namespace"], "team-a");
        assert_eq!(out["kind"], "ResourceBundleState");
    }
}
