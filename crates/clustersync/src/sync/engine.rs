//! Drives one deployment instance across its clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::context::{
    AppContext, AppContextStatus, AppDependencies, AppOrder, ClusterReadyStatus, ContextError,
    ContextReference, ContextStore, InstructionKind, LogicalCloudInfo, ResourceOrder,
};
use crate::depend::{DependError, DependencyManager, DependencyRegistry, WaitOutcome};
use crate::error::{Result, SyncError};
use crate::gitops::{ChangeSet, GitEngineRegistry, WatchSupervisor};
use crate::notify::StatusNotifier;
use crate::provider::{
    select_provider, status_cr_manifest, ArmClient, CloudConfigStore, ClusterSyncProvider,
    ProviderEnv,
};
use crate::readiness::{ReadinessEngine, ReportOutcome, ResourceStatusReport};

/// Suffix of CSR resource names in the tree.
const CSR_RESOURCE_SUFFIX: &str = "+CertificateSigningRequest";

/// Where an instance deploys to, read once from its metadata.
struct Placement {
    namespace: String,
    level: String,
    logical_cloud: LogicalCloudInfo,
}

pub struct SyncEngine {
    store: Arc<dyn ContextStore>,
    env: ProviderEnv,
    dependencies: Arc<DependencyRegistry>,
    supervisor: Arc<WatchSupervisor>,
    readiness: Arc<ReadinessEngine>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ContextStore>,
        cloud_configs: Arc<dyn CloudConfigStore>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        let config = Arc::new(config);
        let dependencies = Arc::new(DependencyRegistry::new());
        let readiness = Arc::new(ReadinessEngine::new(
            Arc::clone(&store),
            Arc::clone(&dependencies),
            notifier,
        ));
        let git_engines = Arc::new(GitEngineRegistry::new(
            config.work_dir.clone(),
            config.git_settings(),
        ));
        let arm = match ArmClient::new(&config.azure) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                log::warn!("Azure Arc clusters are unavailable: {}", e);
                None
            }
        };

        Self {
            env: ProviderEnv {
                config,
                store: Arc::clone(&store),
                cloud_configs,
                git_engines,
                arm,
            },
            store,
            dependencies,
            supervisor: Arc::new(WatchSupervisor::new()),
            readiness,
        }
    }

    pub fn readiness(&self) -> &Arc<ReadinessEngine> {
        &self.readiness
    }

    pub fn dependencies(&self) -> &Arc<DependencyRegistry> {
        &self.dependencies
    }

    pub fn supervisor(&self) -> &Arc<WatchSupervisor> {
        &self.supervisor
    }

    pub fn provider_env(&self) -> &ProviderEnv {
        &self.env
    }

    // ─── Instantiate ─────────────────────────────────────────────────────

    /// Deploys every app of the instance, honouring app dependencies.
    ///
    /// A failing cluster is marked `Retrying` and does not stop its
    /// siblings; the first failure is returned once everything has run.
    #[instrument(level = "info", skip_all, fields(instance = %instance_id))]
    pub async fn instantiate(&self, instance_id: &str, cancel: &CancellationToken) -> Result<()> {
        let reference = ContextReference::new(Arc::clone(&self.store), instance_id).await?;
        reference
            .context()
            .update_status(AppContextStatus::Instantiating)
            .await?;
        log::info!("Instantiating instance {}", instance_id);

        let result = self.run_instantiate(&reference, cancel).await;
        let status = match &result {
            Ok(()) => AppContextStatus::Instantiated,
            Err(e) => {
                log::error!("Instance {} failed to instantiate: {}", instance_id, e);
                AppContextStatus::InstantiateFailed
            }
        };
        self.finish(&reference, status).await;
        result
    }

    async fn run_instantiate(
        &self,
        reference: &ContextReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = reference.context();
        let apps = self.app_order(ctx).await?;
        let dependencies: AppDependencies = decode_instruction(
            InstructionKind::Dependency,
            ctx.get_app_instruction(InstructionKind::Dependency).await,
        )?;

        let manager = self.dependencies.get_or_create(ctx.id());
        let result = self
            .run_apps(reference, &manager, &apps, &dependencies, cancel)
            .await;
        // Every wait has ended here, released or not; a later run registers afresh.
        self.dependencies.remove(ctx.id());
        result
    }

    async fn run_apps(
        &self,
        reference: &ContextReference,
        manager: &Arc<DependencyManager>,
        apps: &[String],
        dependencies: &AppDependencies,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (app, criteria) in &dependencies.apps {
            manager.register_dependencies(app, criteria)?;
        }

        let placement = &self.placement(reference).await?;
        let gates = &AppGates::new(apps, dependencies, cancel);
        for target in gates.prerequisites() {
            self.resume_prerequisite(reference, manager, target).await?;
        }
        let results = join_all(apps.iter().map(|app| async move {
            let result = self
                .instantiate_app(reference, manager, placement, app, gates)
                .await;
            if result.is_err() {
                gates.fail(app);
            }
            result
        }))
        .await;

        first_root_cause(results)
    }

    /// Replays what earlier runs recorded for `target`, so a retried run does
    /// not wait for a transition that already happened.
    async fn resume_prerequisite(
        &self,
        reference: &ContextReference,
        manager: &Arc<DependencyManager>,
        target: &str,
    ) -> Result<()> {
        let flags = async {
            Ok::<_, ContextError>((
                reference.get_app_resources_applied(target).await?,
                reference.get_app_resources_ready(target).await?,
            ))
        };
        let (applied, ready) = match flags.await {
            Ok(flags) => flags,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !applied && !ready {
            return Ok(());
        }

        log::debug!(
            "Prerequisite {} already applied={} ready={}, releasing its dependents",
            target,
            applied,
            ready
        );
        let manager = Arc::clone(manager);
        let target = target.to_string();
        tokio::spawn(async move {
            if applied {
                manager.notify_deployed(&target).await;
            }
            if ready {
                manager.notify_ready(&target).await;
            }
        });
        Ok(())
    }

    async fn instantiate_app(
        &self,
        reference: &ContextReference,
        manager: &DependencyManager,
        placement: &Placement,
        app: &str,
        gates: &AppGates,
    ) -> Result<()> {
        let instance_id = reference.context().id();
        if manager.wait(gates.token(app), app).await == WaitOutcome::Cancelled {
            if let Some(prerequisite) = gates.blocked_by(app) {
                log::warn!(
                    "App {} of instance {} skipped, prerequisite {} failed",
                    app,
                    instance_id,
                    prerequisite
                );
                return Err(DependError::PrerequisiteFailed {
                    app: app.to_string(),
                    prerequisite,
                }
                .into());
            }
            return Err(SyncError::Cancelled(instance_id.to_string()));
        }

        let clusters = reference.context().get_cluster_names(app).await?;
        log::info!("Deploying app {} to {} clusters", app, clusters.len());
        let results = join_all(
            clusters
                .iter()
                .map(|cluster| self.instantiate_cluster(reference, placement, app, cluster)),
        )
        .await;

        self.collect_cluster_errors(reference, app, &clusters, results)
            .await
    }

    #[instrument(level = "debug", skip_all, fields(app = %app, cluster = %cluster))]
    async fn instantiate_cluster(
        &self,
        reference: &ContextReference,
        placement: &Placement,
        app: &str,
        cluster: &str,
    ) -> Result<()> {
        let instance_id = reference.context().id();
        let provider = select_provider(
            &self.env,
            instance_id,
            app,
            cluster,
            &placement.level,
            &placement.namespace,
        )
        .await?;

        let outcome = self
            .push_resources(&provider, reference, placement, app, cluster)
            .await;
        provider.clean_client_provider();
        outcome
    }

    async fn push_resources(
        &self,
        provider: &ClusterSyncProvider,
        reference: &ContextReference,
        placement: &Placement,
        app: &str,
        cluster: &str,
    ) -> Result<()> {
        let ctx = reference.context();
        let target = provider.target();
        let label = target.status_cr_name();
        let order = self.resource_order(ctx, app, cluster).await?;

        provider.apply_config(&placement.logical_cloud).await?;
        let status_cr = status_cr_manifest(target, &self.env.config)?;
        provider.apply_status_cr(&label, &status_cr).await?;

        let mut changes = ChangeSet::new();
        for name in order {
            let content = reference.get_resource(app, cluster, &name).await?;
            let tagged = provider.tag_resource(&content, &label)?;
            changes = provider.create(&name, changes, &tagged).await?;
        }
        provider.commit(changes).await?;

        self.readiness
            .resources_applied(ctx.id(), app, cluster)
            .await?;
        provider.start_cluster_watcher(&self.supervisor, Arc::clone(&self.readiness));
        log::info!("App {} pushed to {} via {}", app, cluster, provider.kind_name());
        Ok(())
    }

    // ─── Terminate ───────────────────────────────────────────────────────

    /// Removes every resource of the instance from its clusters, in reverse
    /// order, and stops its watches and dependency waits.
    #[instrument(level = "info", skip_all, fields(instance = %instance_id))]
    pub async fn terminate(&self, instance_id: &str) -> Result<()> {
        let reference = ContextReference::new(Arc::clone(&self.store), instance_id).await?;
        reference
            .context()
            .update_status(AppContextStatus::Terminating)
            .await?;

        let stopped = self.supervisor.cancel_instance(instance_id);
        self.dependencies.remove(instance_id);
        self.readiness.forget_instance(instance_id);
        log::info!("Terminating instance {} ({} watches stopped)", instance_id, stopped);

        let result = self.run_terminate(&reference).await;
        let status = match &result {
            Ok(()) => AppContextStatus::Terminated,
            Err(e) => {
                log::error!("Instance {} failed to terminate: {}", instance_id, e);
                AppContextStatus::TerminateFailed
            }
        };
        self.finish(&reference, status).await;
        result
    }

    async fn run_terminate(&self, reference: &ContextReference) -> Result<()> {
        let ctx = reference.context();
        let placement = self.placement(reference).await?;
        let mut apps = self.app_order(ctx).await?;
        apps.reverse();

        let mut first_error = None;
        for app in &apps {
            let clusters = ctx.get_cluster_names(app).await?;
            let results = join_all(
                clusters
                    .iter()
                    .map(|cluster| self.terminate_cluster(reference, &placement, app, cluster)),
            )
            .await;
            if let Err(e) = self
                .collect_cluster_errors(reference, app, &clusters, results)
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    #[instrument(level = "debug", skip_all, fields(app = %app, cluster = %cluster))]
    async fn terminate_cluster(
        &self,
        reference: &ContextReference,
        placement: &Placement,
        app: &str,
        cluster: &str,
    ) -> Result<()> {
        let ctx = reference.context();
        let provider = select_provider(
            &self.env,
            ctx.id(),
            app,
            cluster,
            &placement.level,
            &placement.namespace,
        )
        .await?;

        let outcome = async {
            let mut order = self.resource_order(ctx, app, cluster).await?;
            order.reverse();

            let mut changes = ChangeSet::new();
            for name in &order {
                let content = reference.get_resource(app, cluster, name).await?;
                changes = provider.delete(name, changes, &content).await?;
            }
            provider.commit(changes).await?;
            provider
                .delete_status_cr(&provider.target().status_cr_name())
                .await?;
            provider.delete_config(&placement.logical_cloud).await?;
            log::info!("App {} removed from {}", app, cluster);
            Ok(())
        }
        .await;

        provider.clean_client_provider();
        outcome
    }

    // ─── Status reports ──────────────────────────────────────────────────

    /// Hands a report pushed by a cluster monitor to the readiness engine,
    /// then settles any certificate request the report lists as pending.
    #[instrument(level = "debug", skip_all, fields(instance = %instance_id, app = %app, cluster = %cluster))]
    pub async fn handle_status_report(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
        report: &ResourceStatusReport,
    ) -> Result<ReportOutcome> {
        let outcome = self
            .readiness
            .handle_resource_status_report(instance_id, app, cluster, report)
            .await?;

        let pending = report.pending_certificate_requests();
        if !pending.is_empty() && outcome != ReportOutcome::Discarded {
            self.approve_certificate_requests(instance_id, app, cluster, &pending)
                .await?;
        }
        Ok(outcome)
    }

    async fn approve_certificate_requests(
        &self,
        instance_id: &str,
        app: &str,
        cluster: &str,
        pending: &[String],
    ) -> Result<()> {
        let reference = ContextReference::new(Arc::clone(&self.store), instance_id).await?;
        let (namespace, level) = reference.get_namespace().await?;
        let provider =
            select_provider(&self.env, instance_id, app, cluster, &level, &namespace).await?;

        let result = async {
            let Some(kube) = provider.as_kube() else {
                log::debug!(
                    "{} pending certificate requests on {} left to its GitOps agent",
                    pending.len(),
                    cluster
                );
                return Ok(());
            };
            for csr in pending {
                let resource = format!("{}{}", csr, CSR_RESOURCE_SUFFIX);
                match reference
                    .get_sub_resource_approval(app, cluster, &resource)
                    .await?
                {
                    Some(approval) => kube.approve_certificate_request(csr, &approval).await?,
                    None => log::debug!("No approval stored for certificate request {}", csr),
                }
            }
            Ok(())
        }
        .await;

        provider.clean_client_provider();
        result
    }

    /// Cancels every watch and waits for them to stop.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    async fn placement(&self, reference: &ContextReference) -> Result<Placement> {
        let (namespace, level) = reference.get_namespace().await?;
        Ok(Placement {
            namespace,
            level,
            logical_cloud: reference.get_logical_cloud_info().await?,
        })
    }

    /// Apps in `apporder` order; every app when the instruction is absent.
    async fn app_order(&self, ctx: &AppContext) -> Result<Vec<String>> {
        let order: AppOrder = decode_instruction(
            InstructionKind::Order,
            ctx.get_app_instruction(InstructionKind::Order).await,
        )?;
        if order.apps.is_empty() {
            let apps = ctx.get_app_names().await?;
            if !apps.is_empty() {
                log::warn!(
                    "Instance {} has no app order, deploying {} apps in name order",
                    ctx.id(),
                    apps.len()
                );
            }
            return Ok(apps);
        }
        Ok(order.apps)
    }

    /// Resources in `resorder` order. A cluster holding resources must
    /// carry an explicit order.
    async fn resource_order(&self, ctx: &AppContext, app: &str, cluster: &str) -> Result<Vec<String>> {
        let order: ResourceOrder = decode_instruction(
            InstructionKind::Order,
            ctx.get_resource_instruction(app, cluster, InstructionKind::Order)
                .await,
        )?;
        if order.resources.is_empty() && !ctx.get_resource_names(app, cluster).await?.is_empty() {
            return Err(ContextError::InvalidInstruction {
                kind: InstructionKind::Order.as_str().to_string(),
                message: format!("no resorder for app {} on cluster {}", app, cluster),
            }
            .into());
        }
        Ok(order.resources)
    }

    /// Marks failed clusters `Retrying` and returns the first failure.
    async fn collect_cluster_errors(
        &self,
        reference: &ContextReference,
        app: &str,
        clusters: &[String],
        results: Vec<Result<()>>,
    ) -> Result<()> {
        let mut first_error = None;
        for (cluster, result) in clusters.iter().zip(results) {
            let Err(e) = result else { continue };
            log::error!("App {} failed on {}: {}", app, cluster, e);
            if let Err(mark) = reference
                .set_cluster_ready_status(app, cluster, ClusterReadyStatus::Retrying)
                .await
            {
                log::warn!("Could not mark {} as retrying: {}", cluster, mark);
            }
            first_error.get_or_insert(SyncError::on_cluster(app, cluster, e));
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn finish(&self, reference: &ContextReference, status: AppContextStatus) {
        if let Err(e) = reference.context().update_status(status).await {
            log::warn!(
                "Could not record status {} for instance {}: {}",
                status,
                reference.context().id(),
                e
            );
        }
    }
}

/// Per-app cancellation tokens for one instantiate run. When an app fails,
/// the apps waiting on it are cancelled with the failed app recorded.
struct AppGates {
    caller: CancellationToken,
    tokens: HashMap<String, CancellationToken>,
    dependents: HashMap<String, Vec<String>>,
    blocked_by: Mutex<HashMap<String, String>>,
}

impl AppGates {
    fn new(apps: &[String], dependencies: &AppDependencies, cancel: &CancellationToken) -> Self {
        let tokens = apps
            .iter()
            .map(|app| (app.clone(), cancel.child_token()))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (app, criteria) in &dependencies.apps {
            for c in criteria {
                dependents
                    .entry(c.target_app.clone())
                    .or_default()
                    .push(app.clone());
            }
        }
        Self {
            caller: cancel.clone(),
            tokens,
            dependents,
            blocked_by: Mutex::new(HashMap::new()),
        }
    }

    /// Apps some other app waits on.
    fn prerequisites(&self) -> impl Iterator<Item = &str> {
        self.dependents.keys().map(String::as_str)
    }

    fn token(&self, app: &str) -> &CancellationToken {
        self.tokens.get(app).unwrap_or(&self.caller)
    }

    /// Cancels every app waiting on `app`.
    fn fail(&self, app: &str) {
        let Some(dependents) = self.dependents.get(app) else {
            return;
        };
        let mut blocked = match self.blocked_by.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for dependent in dependents {
            blocked
                .entry(dependent.clone())
                .or_insert_with(|| app.to_string());
            if let Some(token) = self.tokens.get(dependent) {
                token.cancel();
            }
        }
    }

    fn blocked_by(&self, app: &str) -> Option<String> {
        let blocked = match self.blocked_by.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        blocked.get(app).cloned()
    }
}

/// Returns the first failure that is not just the knock-on effect of an
/// earlier app failing.
fn first_root_cause(results: Vec<Result<()>>) -> Result<()> {
    let mut knock_on = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(SyncError::Depend(DependError::PrerequisiteFailed { app, prerequisite })) => {
                knock_on.get_or_insert(SyncError::Depend(DependError::PrerequisiteFailed {
                    app,
                    prerequisite,
                }));
            }
            Err(e) => return Err(e),
        }
    }
    knock_on.map_or(Ok(()), Err)
}

/// Instructions may be stored as JSON documents or as JSON strings. A
/// missing instruction decodes to the default.
fn decode_instruction<T: DeserializeOwned + Default>(
    kind: InstructionKind,
    found: std::result::Result<Value, ContextError>,
) -> Result<T> {
    let value = match found {
        Ok(value) => value,
        Err(e) if e.is_not_found() => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    let decoded = match value {
        Value::String(raw) => serde_json::from_str(&raw),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|e| {
        SyncError::from(ContextError::InvalidInstruction {
            kind: kind.as_str().to_string(),
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CompositeAppMeta, MemoryContextStore};
    use crate::error::ErrorKind;
    use crate::notify::NoopNotifier;
    use crate::provider::test_support::init_remote;
    use crate::provider::{GitOpsConfig, KvBundle, MemoryCloudConfigStore};
    use serde_json::json;
    use std::process::Command;
    use tempfile::TempDir;

    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n";
    const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n";

    struct Fixture {
        _dir: TempDir,
        remote: std::path::PathBuf,
        store: Arc<dyn ContextStore>,
        engine: SyncEngine,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let remote = init_remote(dir.path());

        let cloud = Arc::new(MemoryCloudConfigStore::new());
        let bundle: KvBundle = [
            ("gitType", "github"),
            ("userName", "tester"),
            ("repoName", "deploy"),
            ("branch", "main"),
            ("gitToken", "secret-token"),
            ("url", remote.to_str().unwrap()),
        ]
        .into_iter()
        .collect();
        cloud.put_sync_object("edge", "gitref", bundle).await;
        cloud
            .put_gitops_config("edge", "c1", "0", "", GitOpsConfig::new("git", "gitref"))
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let config = EngineConfig {
            work_dir: dir.path().join("work"),
            ..Default::default()
        };
        let engine = SyncEngine::new(config, store.clone(), cloud, Arc::new(NoopNotifier));
        Fixture {
            _dir: dir,
            remote,
            store,
            engine,
        }
    }

    async fn instance(store: &Arc<dyn ContextStore>, clusters: &[&str]) -> AppContext {
        let meta = CompositeAppMeta {
            namespace: "apps".to_string(),
            ..Default::default()
        };
        let ctx = AppContext::create_with_id(store.clone(), "7", &meta).await.unwrap();
        let app = ctx.add_app("web").await.unwrap();
        for cluster in clusters {
            let handle = ctx.add_cluster(&app, cluster).await.unwrap();
            ctx.add_resource(&handle, "svc", SERVICE).await.unwrap();
            ctx.add_resource(&handle, "cm", CONFIG_MAP).await.unwrap();
            ctx.add_instruction(&handle, InstructionKind::Order, json!({"resorder": ["cm", "svc"]}))
                .await
                .unwrap();
        }
        ctx
    }

    fn commit_count(remote: &std::path::Path) -> usize {
        let out = Command::new("git")
            .args(["rev-list", "--count", "main"])
            .current_dir(remote)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
    }

    /// Adds app `db` on `cluster` (no resources) and makes `web` wait for it.
    async fn add_db_prerequisite(ctx: &AppContext, cluster: &str, kind: &str) {
        let db = ctx.add_app("db").await.unwrap();
        ctx.add_cluster(&db, cluster).await.unwrap();
        ctx.add_instruction(
            ctx.root(),
            InstructionKind::Dependency,
            json!({"appdependency": {"web": [{"app": "db", "opStatus": kind}]}}),
        )
        .await
        .unwrap();
    }

    fn tree(remote: &std::path::Path) -> String {
        let out = Command::new("git")
            .args(["ls-tree", "-r", "--name-only", "main"])
            .current_dir(remote)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    #[test]
    fn test_decode_instruction_forms() {
        let order: AppOrder = decode_instruction(
            InstructionKind::Order,
            Ok(Value::String(r#"{"apporder":["db","web"]}"#.to_string())),
        )
        .unwrap();
        assert_eq!(order.apps, vec!["db", "web"]);

        let missing: AppOrder = decode_instruction(
            InstructionKind::Order,
            Err(ContextError::NotFound("order".to_string())),
        )
        .unwrap();
        assert!(missing.apps.is_empty());

        let err = decode_instruction::<AppOrder>(InstructionKind::Order, Ok(json!({"apporder": 5})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_instantiate_pushes_and_marks_applied() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1"]).await;

        f.engine
            .instantiate("7", &CancellationToken::new())
            .await
            .unwrap();

        let files = tree(&f.remote);
        assert!(files.contains("clusters/edge+c1/context/7/app/web/svc.yaml"));
        assert!(files.contains("clusters/edge+c1/context/7/app/web/cm.yaml"));
        assert!(files.contains("clusters/edge+c1/context/7/app/web/7-web.yaml"));

        let reference = ContextReference::from_context(ctx);
        assert!(reference
            .get_cluster_resources_applied("web", "edge+c1")
            .await
            .unwrap());
        assert_eq!(
            reference.context().get_status().await.unwrap(),
            Some(AppContextStatus::Instantiated)
        );
        // Status CR and resources land in separate commits.
        assert_eq!(commit_count(&f.remote), 2);
        assert_eq!(f.engine.supervisor().running(), 1);
        assert!(f.engine.dependencies().is_empty());
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_cluster_does_not_stop_siblings() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1", "edge+missing"]).await;

        let err = f
            .engine
            .instantiate("7", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cluster { ref cluster, .. } if cluster == "edge+missing"));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert!(tree(&f.remote).contains("clusters/edge+c1/context/7/app/web/svc.yaml"));
        let reference = ContextReference::from_context(ctx);
        assert_eq!(
            reference
                .get_cluster_ready_status("web", "edge+missing")
                .await
                .unwrap(),
            ClusterReadyStatus::Retrying
        );
        assert_eq!(
            reference.context().get_status().await.unwrap(),
            Some(AppContextStatus::InstantiateFailed)
        );
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminate_removes_resources() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1"]).await;
        f.engine
            .instantiate("7", &CancellationToken::new())
            .await
            .unwrap();

        f.engine.terminate("7").await.unwrap();

        let files = tree(&f.remote);
        assert!(!files.contains("context/7/app/web/"));
        assert_eq!(f.engine.supervisor().running(), 0);
        assert_eq!(
            ctx.get_status().await.unwrap(),
            Some(AppContextStatus::Terminated)
        );
    }

    #[tokio::test]
    async fn test_cancelled_wait_fails_instance() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1"]).await;
        let db = ctx.add_app("db").await.unwrap();
        ctx.add_cluster(&db, "edge+c1").await.unwrap();
        ctx.add_instruction(
            ctx.root(),
            InstructionKind::Dependency,
            json!({"appdependency": {"web": [{"app": "db", "opStatus": "Ready"}]}}),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.engine.instantiate("7", &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(_)));
        assert!(!tree(&f.remote).contains("context/7/app/web/svc.yaml"));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_for_unknown_instance_is_discarded() {
        let f = fixture().await;
        let outcome = f
            .engine
            .handle_status_report("404", "web", "edge+c1", &ResourceStatusReport::default())
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_retry_after_cancelled_wait() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1"]).await;
        add_db_prerequisite(&ctx, "edge+c1", "Deployed").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.engine.instantiate("7", &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(_)));
        assert!(f.engine.dependencies().is_empty());

        tokio::time::timeout(
            std::time::Duration::from_secs(30),
            f.engine.instantiate("7", &CancellationToken::new()),
        )
        .await
        .expect("retried instantiate hung")
        .unwrap();
        assert!(tree(&f.remote).contains("clusters/edge+c1/context/7/app/web/svc.yaml"));
        assert_eq!(
            ctx.get_status().await.unwrap(),
            Some(AppContextStatus::Instantiated)
        );
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_prerequisite_fails_dependents() {
        let f = fixture().await;
        let ctx = instance(&f.store, &["edge+c1"]).await;
        add_db_prerequisite(&ctx, "edge+missing", "Deployed").await;

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            f.engine.instantiate("7", &CancellationToken::new()),
        )
        .await
        .expect("instantiate hung on a failed prerequisite")
        .unwrap_err();

        assert!(
            matches!(err, SyncError::Cluster { ref app, ref cluster, .. } if app == "db" && cluster == "edge+missing")
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!tree(&f.remote).contains("app/web/"));
        assert_eq!(
            ctx.get_status().await.unwrap(),
            Some(AppContextStatus::InstantiateFailed)
        );
        assert!(f.engine.dependencies().is_empty());
        f.engine.shutdown().await;
    }

    #[test]
    fn test_root_cause_preferred_over_knock_on() {
        let knock_on = || {
            Err(SyncError::from(DependError::PrerequisiteFailed {
                app: "web".to_string(),
                prerequisite: "db".to_string(),
            }))
        };
        let err = first_root_cause(vec![
            knock_on(),
            Ok(()),
            Err(SyncError::Cancelled("7".to_string())),
        ])
        .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(_)));

        let err = first_root_cause(vec![Ok(()), knock_on()]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Depend(DependError::PrerequisiteFailed { .. })
        ));
        assert!(first_root_cause(vec![Ok(()), Ok(())]).is_ok());
    }

    #[tokio::test]
    async fn test_missing_resource_order_is_rejected() {
        let f = fixture().await;
        let meta = CompositeAppMeta {
            namespace: "apps".to_string(),
            ..Default::default()
        };
        let ctx = AppContext::create_with_id(f.store.clone(), "7", &meta).await.unwrap();
        let app = ctx.add_app("web").await.unwrap();
        let handle = ctx.add_cluster(&app, "edge+c1").await.unwrap();
        ctx.add_resource(&handle, "svc", SERVICE).await.unwrap();

        let err = f
            .engine
            .instantiate("7", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let SyncError::Cluster { source, .. } = err else {
            panic!("expected a cluster error");
        };
        assert!(matches!(
            *source,
            SyncError::Context(ContextError::InvalidInstruction { .. })
        ));
        assert!(!tree(&f.remote).contains("context/7/"));
        f.engine.shutdown().await;
    }
}
