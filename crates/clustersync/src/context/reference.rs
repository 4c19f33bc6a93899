//! Instance-scoped helpers used by the synchronization engine.

use std::sync::Arc;

use serde_json::Value;

use super::app_context::{AppContext, Handle};
use super::error::{ContextError, Result};
use super::store::ContextStore;
use super::types::{ClusterReadyStatus, LogicalCloudInfo};

/// Per-cluster "status report" level.
pub const STATUS_LEVEL: &str = "status";
/// Per-cluster and per-app readiness flag.
pub const RESOURCES_READY_LEVEL: &str = "resourcesready";
/// Per-cluster "resources accepted by the cluster" flag.
pub const RESOURCES_APPLIED_LEVEL: &str = "resourcesapplied";
/// Per-cluster reachability.
pub const READY_STATUS_LEVEL: &str = "readystatus";
/// Instance-level pointer to a prior instance id.
pub const REFERENCE_LEVEL: &str = "reference";
const STATUS_REVISION_LEVEL: &str = "statusrevision";
const APPROVAL_LEVEL: &str = "approval";

/// Accessor for the engine-owned levels of one instance.
#[derive(Debug, Clone)]
pub struct ContextReference {
    ctx: AppContext,
}

impl ContextReference {
    /// Opens the instance. Fails with `NotFound` if it does not exist.
    pub async fn new(store: Arc<dyn ContextStore>, id: &str) -> Result<Self> {
        Ok(Self {
            ctx: AppContext::load(store, id).await?,
        })
    }

    pub fn from_context(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Returns `(namespace, level)` of the deployment.
    pub async fn get_namespace(&self) -> Result<(String, String)> {
        let meta = self.ctx.get_composite_app_meta().await?;
        Ok((meta.namespace, meta.level))
    }

    pub async fn get_level(&self) -> Result<String> {
        Ok(self.ctx.get_composite_app_meta().await?.level)
    }

    pub async fn get_logical_cloud_info(&self) -> Result<LogicalCloudInfo> {
        let meta = self.ctx.get_composite_app_meta().await?;
        Ok(LogicalCloudInfo {
            name: meta.logical_cloud,
            namespace: meta.logical_cloud_namespace,
            level: meta.logical_cloud_level,
        })
    }

    // ─── Readiness flags ─────────────────────────────────────────────────

    pub async fn set_cluster_resources_ready(
        &self,
        app: &str,
        cluster: &str,
        ready: bool,
    ) -> Result<()> {
        self.set_cluster_flag(app, cluster, RESOURCES_READY_LEVEL, ready)
            .await
    }

    /// Reads the cluster readiness flag. An absent flag reads as false.
    pub async fn get_cluster_resources_ready(&self, app: &str, cluster: &str) -> Result<bool> {
        self.get_cluster_flag(app, cluster, RESOURCES_READY_LEVEL)
            .await
    }

    pub async fn set_cluster_resources_applied(
        &self,
        app: &str,
        cluster: &str,
        applied: bool,
    ) -> Result<()> {
        self.set_cluster_flag(app, cluster, RESOURCES_APPLIED_LEVEL, applied)
            .await
    }

    pub async fn get_cluster_resources_applied(&self, app: &str, cluster: &str) -> Result<bool> {
        self.get_cluster_flag(app, cluster, RESOURCES_APPLIED_LEVEL)
            .await
    }

    /// Writes the app-wide readiness flag and returns its previous value.
    pub async fn set_app_resources_ready(&self, app: &str, ready: bool) -> Result<bool> {
        self.set_app_flag(app, RESOURCES_READY_LEVEL, ready).await
    }

    /// Writes the app-wide "applied on every cluster" flag and returns its
    /// previous value.
    pub async fn set_app_resources_applied(&self, app: &str, applied: bool) -> Result<bool> {
        self.set_app_flag(app, RESOURCES_APPLIED_LEVEL, applied)
            .await
    }

    pub async fn get_app_resources_applied(&self, app: &str) -> Result<bool> {
        let handle = self.ctx.get_app_handle(app).await?;
        self.read_flag(&handle, RESOURCES_APPLIED_LEVEL).await
    }

    pub async fn get_app_resources_ready(&self, app: &str) -> Result<bool> {
        let handle = self.ctx.get_app_handle(app).await?;
        self.read_flag(&handle, RESOURCES_READY_LEVEL).await
    }

    pub async fn set_cluster_ready_status(
        &self,
        app: &str,
        cluster: &str,
        status: ClusterReadyStatus,
    ) -> Result<()> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        self.ctx
            .upsert_level_value(&handle, READY_STATUS_LEVEL, &status)
            .await?;
        Ok(())
    }

    pub async fn get_cluster_ready_status(
        &self,
        app: &str,
        cluster: &str,
    ) -> Result<ClusterReadyStatus> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        match self
            .ctx
            .get_value_as(&handle.level(READY_STATUS_LEVEL))
            .await
        {
            Ok(status) => Ok(status),
            Err(e) if e.is_not_found() => Ok(ClusterReadyStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    // ─── Status payloads ─────────────────────────────────────────────────

    /// Stores the latest status payload for `(app, cluster)`, with the
    /// revision it was observed at when the monitor supplied one.
    pub async fn put_cluster_status(
        &self,
        app: &str,
        cluster: &str,
        payload: Value,
        revision: Option<u64>,
    ) -> Result<()> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        self.ctx
            .add_level_value(&handle, STATUS_LEVEL, payload)
            .await?;
        if let Some(revision) = revision {
            self.ctx
                .upsert_level_value(&handle, STATUS_REVISION_LEVEL, &revision)
                .await?;
        }
        Ok(())
    }

    pub async fn get_cluster_status(&self, app: &str, cluster: &str) -> Result<Option<Value>> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        optional(self.ctx.get_value(&handle.level(STATUS_LEVEL)).await)
    }

    pub async fn get_cluster_status_revision(
        &self,
        app: &str,
        cluster: &str,
    ) -> Result<Option<u64>> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        optional(
            self.ctx
                .get_value_as(&handle.level(STATUS_REVISION_LEVEL))
                .await,
        )
    }

    // ─── Resources ───────────────────────────────────────────────────────

    pub async fn get_resource(&self, app: &str, cluster: &str, name: &str) -> Result<String> {
        let handle = self.ctx.get_resource_handle(app, cluster, name).await?;
        match self.ctx.get_value(&handle).await? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    pub async fn put_resource(
        &self,
        app: &str,
        cluster: &str,
        name: &str,
        content: &str,
    ) -> Result<()> {
        let cluster_handle = self.ctx.get_cluster_handle(app, cluster).await?;
        self.ctx
            .add_resource(&cluster_handle, name, content)
            .await?;
        Ok(())
    }

    pub async fn set_sub_resource_approval(
        &self,
        app: &str,
        cluster: &str,
        name: &str,
        approval: Value,
    ) -> Result<()> {
        let handle = self.ctx.get_resource_handle(app, cluster, name).await?;
        let sub = sub_resource_handle(&handle);
        self.ctx.add_level_value(&sub, APPROVAL_LEVEL, approval).await?;
        Ok(())
    }

    /// Looks up the approval document of a resource's sub-resource.
    ///
    /// When this instance has none, the lookup follows the instance's
    /// reference to a prior instance (one hop), so a credential approved
    /// under a previous instance is reused after an update.
    pub async fn get_sub_resource_approval(
        &self,
        app: &str,
        cluster: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        if let Some(found) = self.local_approval(app, cluster, name).await? {
            return Ok(Some(found));
        }

        let Some(reference) = self.get_reference().await? else {
            return Ok(None);
        };
        if reference == self.ctx.id() {
            return Ok(None);
        }

        match ContextReference::new(self.ctx.store().clone(), &reference).await {
            Ok(prior) => prior.local_approval(app, cluster, name).await,
            Err(e) if e.is_not_found() => {
                log::debug!(
                    "Referenced instance {} no longer exists, no approval to reuse",
                    reference
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Points this instance at a prior instance id.
    pub async fn add_reference(&self, other_instance: &str) -> Result<()> {
        self.ctx
            .upsert_level_value(self.ctx.root(), REFERENCE_LEVEL, &other_instance)
            .await?;
        Ok(())
    }

    pub async fn get_reference(&self) -> Result<Option<String>> {
        optional(
            self.ctx
                .get_value_as(&self.ctx.root().level(REFERENCE_LEVEL))
                .await,
        )
    }

    // ─── Private helpers ─────────────────────────────────────────────────

    async fn local_approval(&self, app: &str, cluster: &str, name: &str) -> Result<Option<Value>> {
        let handle = match self.ctx.get_resource_handle(app, cluster, name).await {
            Ok(h) => h,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let sub = sub_resource_handle(&handle);
        optional(self.ctx.get_value(&sub.level(APPROVAL_LEVEL)).await)
    }

    async fn set_cluster_flag(
        &self,
        app: &str,
        cluster: &str,
        level: &str,
        value: bool,
    ) -> Result<()> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        self.ctx.upsert_level_value(&handle, level, &value).await?;
        Ok(())
    }

    async fn set_app_flag(&self, app: &str, level: &str, value: bool) -> Result<bool> {
        let handle = self.ctx.get_app_handle(app).await?;
        let previous = self.read_flag(&handle, level).await?;
        self.ctx.upsert_level_value(&handle, level, &value).await?;
        Ok(previous)
    }

    async fn get_cluster_flag(&self, app: &str, cluster: &str, level: &str) -> Result<bool> {
        let handle = self.ctx.get_cluster_handle(app, cluster).await?;
        self.read_flag(&handle, level).await
    }

    async fn read_flag(&self, handle: &Handle, level: &str) -> Result<bool> {
        match self.ctx.get_value(&handle.level(level)).await {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(other) => Err(ContextError::Storage(format!(
                "Expected boolean at {}{}/, found {}",
                handle, level, other
            ))),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn sub_resource_handle(resource: &Handle) -> Handle {
    resource.level("subresource")
}

fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::memory::MemoryContextStore;
    use crate::context::types::CompositeAppMeta;
    use serde_json::json;

    async fn instance(store: Arc<dyn ContextStore>, id: &str) -> ContextReference {
        let meta = CompositeAppMeta {
            namespace: "ns1".into(),
            level: "1".into(),
            logical_cloud: "lc1".into(),
            logical_cloud_namespace: "lcns".into(),
            logical_cloud_level: "1".into(),
            ..Default::default()
        };
        let ctx = AppContext::create_with_id(store, id, &meta).await.unwrap();
        let app = ctx.add_app("app1").await.unwrap();
        let cluster = ctx.add_cluster(&app, "p+c1").await.unwrap();
        ctx.add_resource(&cluster, "csr1+CertificateSigningRequest", "{}")
            .await
            .unwrap();
        ContextReference::from_context(ctx)
    }

    #[tokio::test]
    async fn test_flags_default_to_false() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let r = instance(store, "1").await;
        assert!(!r.get_cluster_resources_ready("app1", "p+c1").await.unwrap());
        r.set_cluster_resources_ready("app1", "p+c1", true)
            .await
            .unwrap();
        assert!(r.get_cluster_resources_ready("app1", "p+c1").await.unwrap());

        assert!(!r.set_app_resources_ready("app1", true).await.unwrap());
        assert!(r.set_app_resources_ready("app1", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespace_and_logical_cloud() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let r = instance(store, "1").await;
        assert_eq!(
            r.get_namespace().await.unwrap(),
            ("ns1".to_string(), "1".to_string())
        );
        let lc = r.get_logical_cloud_info().await.unwrap();
        assert_eq!(lc.name, "lc1");
        assert_eq!(lc.namespace, "lcns");
    }

    #[tokio::test]
    async fn test_approval_follows_reference() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let prior = instance(store.clone(), "1").await;
        prior
            .set_sub_resource_approval(
                "app1",
                "p+c1",
                "csr1+CertificateSigningRequest",
                json!({"type": "Approved"}),
            )
            .await
            .unwrap();

        let current = instance(store.clone(), "2").await;
        assert!(current
            .get_sub_resource_approval("app1", "p+c1", "csr1+CertificateSigningRequest")
            .await
            .unwrap()
            .is_none());

        current.add_reference("1").await.unwrap();
        let approval = current
            .get_sub_resource_approval("app1", "p+c1", "csr1+CertificateSigningRequest")
            .await
            .unwrap();
        assert_eq!(approval, Some(json!({"type": "Approved"})));
    }

    #[tokio::test]
    async fn test_cluster_status_revision() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let r = instance(store, "1").await;
        assert_eq!(r.get_cluster_status_revision("app1", "p+c1").await.unwrap(), None);
        r.put_cluster_status("app1", "p+c1", json!({"ready": true}), Some(7))
            .await
            .unwrap();
        assert_eq!(
            r.get_cluster_status_revision("app1", "p+c1").await.unwrap(),
            Some(7)
        );
        assert_eq!(
            r.get_cluster_status("app1", "p+c1").await.unwrap(),
            Some(json!({"ready": true}))
        );
    }

    #[tokio::test]
    async fn test_ready_status_defaults_unknown() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let r = instance(store, "1").await;
        assert_eq!(
            r.get_cluster_ready_status("app1", "p+c1").await.unwrap(),
            ClusterReadyStatus::Unknown
        );
        r.set_cluster_ready_status("app1", "p+c1", ClusterReadyStatus::Available)
            .await
            .unwrap();
        assert_eq!(
            r.get_cluster_ready_status("app1", "p+c1").await.unwrap(),
            ClusterReadyStatus::Available
        );
    }
}
