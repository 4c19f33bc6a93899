//! Aggregates per-cluster status reports into app readiness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use super::checker::ReadyChecker;
use super::report::ResourceStatusReport;
use crate::context::error::{ContextError, Result};
use crate::context::{ClusterReadyStatus, ContextReference, ContextStore};
use crate::depend::DependencyRegistry;
use crate::notify::{StatusEvent, StatusEventKind, StatusNotifier};

/// What happened to one status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The instance (or its app/cluster) no longer exists; the report
    /// arrived too late and was dropped.
    Discarded,
    /// The report is older than the one already stored.
    Stale,
    /// The app is not ready on this cluster.
    ClusterNotReady,
    /// The app is ready on this cluster. `app_ready` tells whether it is
    /// now ready on every cluster.
    ClusterReady { app_ready: bool },
}

/// Turns status reports into readiness flags, dependency releases and
/// notifications.
pub struct ReadinessEngine {
    store: Arc<dyn ContextStore>,
    dependencies: Arc<DependencyRegistry>,
    notifier: Arc<dyn StatusNotifier>,
    checker: ReadyChecker,
    /// Serialises flag recomputation per (instance, app).
    app_locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl ReadinessEngine {
    pub fn new(
        store: Arc<dyn ContextStore>,
        dependencies: Arc<DependencyRegistry>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        Self {
            store,
            dependencies,
            notifier,
            checker: ReadyChecker::default(),
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_checker(mut self, checker: ReadyChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn dependencies(&self) -> &Arc<DependencyRegistry> {
        &self.dependencies
    }

    /// Decodes a raw status document and handles it. Undecodable documents
    /// mark the cluster not ready instead of failing.
    pub async fn handle_status_document(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
        document: &str,
    ) -> Result<ReportOutcome> {
        match ResourceStatusReport::from_yaml(document) {
            Ok(report) => {
                self.handle_resource_status_report(instance_id, app, cluster, &report)
                    .await
            }
            Err(e) => {
                log::warn!(
                    "Malformed status report for {}/{} on {}: {}",
                    instance_id,
                    app,
                    cluster,
                    e
                );
                self.mark_cluster_not_ready(instance_id, app, cluster).await
            }
        }
    }

    /// Stores the report, evaluates readiness on the cluster and, when every
    /// cluster is ready, releases dependents and notifies subscribers.
    ///
    /// Only storage failures while writing flags are returned as errors.
    #[instrument(level = "debug", skip_all, fields(instance = %instance_id, app = %app, cluster = %cluster))]
    pub async fn handle_resource_status_report(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
        report: &ResourceStatusReport,
    ) -> Result<ReportOutcome> {
        let Some(reference) = self.open(instance_id, app, cluster).await? else {
            return Ok(ReportOutcome::Discarded);
        };
        let lock = self.app_lock(instance_id, app);
        let _guard = lock.lock().await;

        let revision = report.revision();
        if let (Some(incoming), Some(stored)) = (
            revision,
            reference.get_cluster_status_revision(app, cluster).await?,
        ) {
            if incoming < stored {
                log::info!(
                    "Ignoring stale status report for {} on {} (revision {} < {})",
                    app,
                    cluster,
                    incoming,
                    stored
                );
                return Ok(ReportOutcome::Stale);
            }
        }

        match serde_json::to_value(&report.status) {
            Ok(payload) => {
                reference
                    .put_cluster_status(app, cluster, payload, revision)
                    .await?
            }
            Err(e) => {
                log::warn!("Failed to serialize status of {} on {}: {}", app, cluster, e);
                return self.write_not_ready(&reference, app, cluster).await;
            }
        }

        if !self.checker.is_app_ready(report) {
            return self.write_not_ready(&reference, app, cluster).await;
        }

        log::info!("App {} is ready on cluster {} (instance {})", app, cluster, instance_id);
        reference
            .set_cluster_resources_ready(app, cluster, true)
            .await?;

        let mut app_ready = true;
        for name in reference.context().get_cluster_names(app).await? {
            if !reference.get_cluster_resources_ready(app, &name).await? {
                app_ready = false;
                break;
            }
        }

        let was_ready = reference.set_app_resources_ready(app, app_ready).await?;
        if app_ready && !was_ready {
            log::info!("App {} is ready on all clusters (instance {})", app, instance_id);
            self.release(instance_id, app, StatusEventKind::Ready);
        }

        Ok(ReportOutcome::ClusterReady { app_ready })
    }

    /// Records that `cluster` accepted every resource of `app`. Once all
    /// clusters of the app have, dependents waiting for `Deployed` are
    /// released.
    #[instrument(level = "debug", skip_all, fields(instance = %instance_id, app = %app, cluster = %cluster))]
    pub async fn resources_applied(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
    ) -> Result<bool> {
        let Some(reference) = self.open(instance_id, app, cluster).await? else {
            return Ok(false);
        };
        let lock = self.app_lock(instance_id, app);
        let _guard = lock.lock().await;

        reference
            .set_cluster_resources_applied(app, cluster, true)
            .await?;
        reference
            .set_cluster_ready_status(app, cluster, ClusterReadyStatus::Available)
            .await?;

        let mut all_applied = true;
        for name in reference.context().get_cluster_names(app).await? {
            if !reference.get_cluster_resources_applied(app, &name).await? {
                all_applied = false;
                break;
            }
        }

        let was_applied = reference
            .set_app_resources_applied(app, all_applied)
            .await?;
        if all_applied && !was_applied {
            log::info!("App {} is deployed on all clusters (instance {})", app, instance_id);
            self.release(instance_id, app, StatusEventKind::Deployed);
        }
        Ok(all_applied)
    }

    async fn mark_cluster_not_ready(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
    ) -> Result<ReportOutcome> {
        match self.open(instance_id, app, cluster).await? {
            Some(reference) => {
                let lock = self.app_lock(instance_id, app);
                let _guard = lock.lock().await;
                self.write_not_ready(&reference, app, cluster).await
            }
            None => Ok(ReportOutcome::Discarded),
        }
    }

    /// Drops the flag locks of a terminated instance.
    pub fn forget_instance(&self, instance_id: &str) {
        self.lock_table().retain(|(id, _), _| id != instance_id);
    }

    fn app_lock(&self, instance_id: &str, app: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.lock_table();
        Arc::clone(
            locks
                .entry((instance_id.to_string(), app.to_string()))
                .or_default(),
        )
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<(String, String), Arc<AsyncMutex<()>>>> {
        match self.app_locks.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Readiness lock table was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    async fn write_not_ready(
        &self,
        reference: &ContextReference,
        app: &str,
        cluster: &str,
    ) -> Result<ReportOutcome> {
        reference
            .set_cluster_resources_ready(app, cluster, false)
            .await?;
        reference.set_app_resources_ready(app, false).await?;
        Ok(ReportOutcome::ClusterNotReady)
    }

    /// Opens the instance and checks that `(app, cluster)` exists in it.
    async fn open(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
    ) -> Result<Option<ContextReference>> {
        let reference = match ContextReference::new(self.store.clone(), instance_id).await {
            Ok(r) => r,
            Err(ContextError::NotFound(_)) => {
                log::info!(
                    "Instance {} not found, dropping status for {} on {}",
                    instance_id,
                    app,
                    cluster
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match reference.context().get_cluster_handle(app, cluster).await {
            Ok(_) => Ok(Some(reference)),
            Err(ContextError::NotFound(_)) => {
                log::info!(
                    "App {} has no cluster {} in instance {}, dropping status",
                    app,
                    cluster,
                    instance_id
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn release(&self, instance_id: &str, app: &str, kind: StatusEventKind) {
        self.notifier.notify(StatusEvent::new(instance_id, app, kind));

        let dependencies = Arc::clone(&self.dependencies);
        let instance_id = instance_id.to_string();
        let app = app.to_string();
        // Settle delays must not hold up the caller.
        tokio::spawn(async move {
            match kind {
                StatusEventKind::Ready => dependencies.resources_ready(&instance_id, &app).await,
                StatusEventKind::Deployed => {
                    dependencies.resources_deployed(&instance_id, &app).await
                }
            }
        });
    }
}
