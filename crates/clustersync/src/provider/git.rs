//! Plain git provider.
//!
//! Resources are committed as files under
//! `clusters/<cluster>/context/<cid>/app/<app>/`; the cluster's agent
//! writes status back under `.../status/...` on a branch named after the
//! cluster. The other GitOps variants wrap this type and add their own
//! agent configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::error::{ProviderError, Result};
use super::lookup::{GitOpsConfig, KvBundle};
use super::tag::tag_manifest;
use super::{ProviderEnv, SyncTarget};
use crate::context::ContextStore;
use crate::gitops::{
    ChangeSet, GitRemote, GitRepositoryEngine, GitStatusSource, StatusWatch, WatchKey,
    WatchSupervisor,
};
use crate::readiness::ReadinessEngine;
use crate::sanitize::redact_repo_url;

pub struct GitProvider {
    target: SyncTarget,
    engine: Arc<GitRepositoryEngine>,
    branch: String,
    url: String,
    base_dir: String,
    status_branch: String,
    store: Arc<dyn ContextStore>,
    watch_interval: Duration,
    deployment_label: String,
}

impl GitProvider {
    /// Resolves the git bundle named by `gitops.reference_object` and binds
    /// the shared engine for that repository.
    pub async fn new(env: &ProviderEnv, target: SyncTarget, gitops: &GitOpsConfig) -> Result<Self> {
        let cluster = target.cluster.to_string();
        let bundle = load_bundle(env, &target, &gitops.reference_object).await?;

        let git_type = bundle.require(&cluster, "gitType")?;
        let user = bundle.require(&cluster, "userName")?;
        let repo = bundle.require(&cluster, "repoName")?;
        let branch = bundle.require(&cluster, "branch")?.to_string();
        let token = bundle.require_secret(&cluster, "gitToken")?;
        let url = bundle
            .get("url")
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://{}.com/{}/{}", git_type, user, repo));

        log::debug!(
            "Git provider for {} uses {} on branch {}",
            cluster,
            redact_repo_url(&url),
            branch
        );

        let remote = GitRemote {
            url: url.clone(),
            user: user.to_string(),
            repo: repo.to_string(),
            branch: branch.clone(),
            token: Some(token),
        };
        let engine = env.git_engines.engine_for(&remote);

        Ok(Self {
            base_dir: format!("clusters/{}", cluster),
            status_branch: cluster,
            target,
            engine,
            branch,
            url,
            store: Arc::clone(&env.store),
            watch_interval: env.config.watch_interval(),
            deployment_label: env.config.deployment_label.clone(),
        })
    }

    /// Places the tree under `base_dir` instead of `clusters/<cluster>`.
    pub(crate) fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Reads status from `branch` instead of the cluster branch.
    pub(crate) fn with_status_branch(mut self, branch: impl Into<String>) -> Self {
        self.status_branch = branch.into();
        self
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn engine(&self) -> &Arc<GitRepositoryEngine> {
        &self.engine
    }

    /// Labels the manifest and places namespaced objects in the deployment
    /// namespace when they name none.
    pub fn tag_resource(&self, content: &str, label: &str) -> Result<String> {
        let namespace = Some(self.target.namespace.as_str()).filter(|ns| !ns.is_empty());
        tag_manifest(content, &self.deployment_label, label, namespace)
    }

    /// `<base>/<kind>/<cid>`
    pub fn instance_dir(&self, kind: &str) -> String {
        format!("{}/{}/{}", self.base_dir, kind, self.target.instance_id)
    }

    /// `<base>/<kind>/<cid>/app/<app>/`
    pub fn path(&self, kind: &str) -> String {
        format!("{}/app/{}/", self.instance_dir(kind), self.target.app)
    }

    pub fn resource_path(&self, name: &str) -> String {
        format!("{}{}.yaml", self.path("context"), name)
    }

    pub fn stage(&self, name: &str, mut changes: ChangeSet, content: &str) -> ChangeSet {
        changes.add(self.resource_path(name), content);
        changes
    }

    pub fn unstage(&self, name: &str, mut changes: ChangeSet) -> ChangeSet {
        changes.delete(self.resource_path(name));
        changes
    }

    /// Commits the batch to the configured branch. An empty batch is a
    /// no-op.
    pub async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        let message = format!("Commit for {}", self.path("context"));
        self.commit_with_message(&message, changes).await
    }

    #[instrument(level = "debug", skip_all, fields(cluster = %self.target.cluster, files = changes.len()))]
    pub async fn commit_with_message(&self, message: &str, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            log::debug!("Nothing to commit for {}", self.target.cluster);
            return Ok(());
        }
        let outcome = self
            .engine
            .commit_files(&self.branch, message, changes)
            .await?;
        match outcome.commit_id {
            Some(id) => log::info!("Pushed {} to {} ({})", message, self.target.cluster, id),
            None => log::debug!("{}: no changes for {}", outcome.message, self.target.cluster),
        }
        Ok(())
    }

    pub async fn apply_status_cr(&self, name: &str, content: &str) -> Result<()> {
        let changes = self.stage(name, ChangeSet::new(), content);
        self.commit_with_message(&format!("Commit for {}", self.resource_path(name)), &changes)
            .await
    }

    pub async fn delete_status_cr(&self, name: &str) -> Result<()> {
        let changes = self.unstage(name, ChangeSet::new());
        self.commit_with_message(&format!("Commit for {}", self.resource_path(name)), &changes)
            .await
    }

    /// Starts the status watch of this `(instance, app, cluster)`. Returns
    /// false when one is already running.
    pub fn start_cluster_watcher(
        &self,
        supervisor: &WatchSupervisor,
        readiness: Arc<ReadinessEngine>,
    ) -> bool {
        let key = WatchKey::new(
            &self.target.instance_id,
            &self.target.app,
            self.target.cluster.to_string(),
        );
        let source = GitStatusSource::new(
            Arc::clone(&self.engine),
            self.status_branch.clone(),
            self.path("status"),
            self.branch.clone(),
            self.resource_path(&self.target.status_cr_name()),
        );
        let watch = StatusWatch::new(
            key.clone(),
            source,
            Arc::clone(&self.store),
            readiness,
            self.watch_interval,
        );
        supervisor.start(key, |cancel| watch.run(cancel))
    }
}

/// Loads a named bundle of the target's cluster provider.
pub(crate) async fn load_bundle(
    env: &ProviderEnv,
    target: &SyncTarget,
    name: &str,
) -> Result<KvBundle> {
    env.cloud_configs
        .get_sync_object(&target.cluster.provider, name)
        .await?
        .ok_or_else(|| {
            ProviderError::missing(
                &target.cluster.to_string(),
                format!("sync object '{}' not found", name),
            )
        })
}
