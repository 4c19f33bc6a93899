//! Direct provider: talks to the cluster API with a stored kubeconfig.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::StreamExt;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{pinned_kind, ApiResource, Scope};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::error::{is_conflict, is_not_found, ProviderError, Result};
use super::tag::tag_manifest;
use super::{ProviderEnv, SyncTarget, STATUS_NAMESPACE};
use crate::config::RetryConfig;
use crate::gitops::{WatchKey, WatchSupervisor};
use crate::readiness::{ReadinessEngine, ResourceStatusReport, STATUS_KIND};

const STATUS_GROUP: &str = "k8splugin.io";
const STATUS_VERSION: &str = "v1alpha1";

pub struct KubeProvider {
    target: SyncTarget,
    client: Client,
    kubeconfig_file: Mutex<Option<NamedTempFile>>,
    field_manager: String,
    deployment_label: String,
    instance_label: String,
    conflict_retry: RetryConfig,
}

impl KubeProvider {
    /// Decodes the base64 kubeconfig into a temporary file and builds a
    /// client from it. The file lives until `clean_client_provider` or drop.
    pub async fn new(env: &ProviderEnv, target: SyncTarget, kubeconfig_b64: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(kubeconfig_b64.trim())
            .map_err(|e| ProviderError::Kubeconfig(format!("invalid base64: {}", e)))?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("rsync-config-{}-", target.cluster.cluster))
            .tempfile()?;
        file.write_all(&decoded)?;
        file.flush()?;

        let kubeconfig =
            Kubeconfig::read_from(file.path()).map_err(|e| ProviderError::Kubeconfig(e.to_string()))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ProviderError::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config)?;

        log::debug!("Kubernetes client ready for {}", target.cluster);

        Ok(Self {
            target,
            client,
            kubeconfig_file: Mutex::new(Some(file)),
            field_manager: env.config.field_manager.clone(),
            deployment_label: env.config.deployment_label.clone(),
            instance_label: env.config.instance_label.clone(),
            conflict_retry: env.config.conflict_retry.clone(),
        })
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn tag_resource(&self, content: &str, label: &str) -> Result<String> {
        tag_manifest(content, &self.deployment_label, label, None)
    }

    /// Path of the temporary kubeconfig, while it exists.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.file_lock().as_ref().map(|f| f.path().to_path_buf())
    }

    /// Server-side applies the manifest.
    #[instrument(level = "debug", skip_all, fields(cluster = %self.target.cluster, resource = %name))]
    pub async fn apply(&self, name: &str, content: &str) -> Result<()> {
        let (object, gvk) = parse_manifest(content)?;
        let object_name = manifest_name(&object)?;
        let api = self.api_for(&object, &gvk).await?;

        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&object_name, &params, &Patch::Apply(&object))
            .await?;
        log::info!("Applied {} {} to {}", gvk.kind, object_name, self.target.cluster);
        Ok(())
    }

    /// Deletes the object described by the manifest. Already gone is
    /// success.
    #[instrument(level = "debug", skip_all, fields(cluster = %self.target.cluster, resource = %name))]
    pub async fn delete(&self, name: &str, content: &str) -> Result<()> {
        let (object, gvk) = parse_manifest(content)?;
        let object_name = manifest_name(&object)?;
        let api = match self.api_for(&object, &gvk).await {
            Ok(api) => api,
            Err(ProviderError::Kube(e)) if is_not_found(&e) => {
                log::debug!("Kind {} is not served by {}, nothing to delete", gvk.kind, self.target.cluster);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match api.delete(&object_name, &DeleteParams::background()).await {
            Ok(_) => {
                log::info!("Deleted {} {} from {}", gvk.kind, object_name, self.target.cluster);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                log::debug!("{} {} already absent from {}", gvk.kind, object_name, self.target.cluster);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_reachable(&self) -> Result<()> {
        match self.client.apiserver_version().await {
            Ok(info) => {
                log::debug!("{} runs Kubernetes {}", self.target.cluster, info.git_version);
                Ok(())
            }
            Err(e) => {
                log::warn!("Cluster {} is unreachable: {}", self.target.cluster, e);
                Err(ProviderError::Unreachable(self.target.cluster.to_string()))
            }
        }
    }

    /// Creates or replaces the monitor's status CR.
    #[instrument(level = "debug", skip_all, fields(cluster = %self.target.cluster, name = %name))]
    pub async fn apply_status_cr(&self, name: &str, content: &str) -> Result<()> {
        let (mut desired, _) = parse_manifest(content)?;
        let namespace = desired
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| STATUS_NAMESPACE.to_string());
        desired.metadata.namespace = Some(namespace.clone());
        let api = self.status_api(&namespace);

        let api = &api;
        let desired = &desired;
        retry_on_conflict(&self.conflict_retry, name, || async move {
            match api.get_opt(name).await? {
                None => api.create(&PostParams::default(), desired).await,
                Some(existing) => {
                    let mut object = desired.clone();
                    object.metadata.resource_version = existing.metadata.resource_version;
                    api.replace(name, &PostParams::default(), &object).await
                }
            }
        })
        .await?;
        Ok(())
    }

    pub async fn delete_status_cr(&self, name: &str) -> Result<()> {
        match self
            .status_api(STATUS_NAMESPACE)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds an `Approved` or `Denied` condition to a certificate signing
    /// request through its approval subresource.
    #[instrument(level = "debug", skip_all, fields(cluster = %self.target.cluster, csr = %name))]
    pub async fn approve_certificate_request(&self, name: &str, approval: &Value) -> Result<()> {
        let condition = approval_condition(approval)?;
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());

        let api = &api;
        let condition = &condition;
        retry_on_conflict(&self.conflict_retry, name, || async move {
            let mut csr = api.get(name).await?;
            let status = csr.status.get_or_insert_with(Default::default);
            let conditions = status.conditions.get_or_insert_with(Vec::new);
            if conditions.iter().any(|c| c.type_ == condition.type_) {
                return Ok(csr);
            }
            conditions.push(condition.clone());
            let data = serde_json::to_vec(&csr).map_err(kube::Error::SerdeError)?;
            api.replace_subresource("approval", name, &PostParams::default(), data)
                .await
        })
        .await?;
        log::info!(
            "Certificate request {} on {} marked {}",
            name,
            self.target.cluster,
            condition.type_
        );
        Ok(())
    }

    /// Watches the status CR of this `(instance, app)` and forwards every
    /// applied version to the readiness engine.
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
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &status_resource());
        let selector = format!("{}={}", self.instance_label, self.target.status_cr_name());
        let target = self.target.clone();
        supervisor.start(key, move |cancel| {
            watch_status(api, selector, target, readiness, cancel)
        })
    }

    /// Removes the temporary kubeconfig.
    pub fn clean_client_provider(&self) {
        if let Some(file) = self.file_lock().take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                log::warn!("Failed to remove kubeconfig {}: {}", path.display(), e);
            }
        }
    }

    async fn api_for(&self, object: &DynamicObject, gvk: &GroupVersionKind) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = pinned_kind(&self.client, gvk).await?;
        if capabilities.scope == Scope::Cluster {
            return Ok(Api::all_with(self.client.clone(), &resource));
        }
        let namespace = object
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| Some(self.target.namespace.clone()).filter(|ns| !ns.is_empty()))
            .unwrap_or_else(|| "default".to_string());
        Ok(Api::namespaced_with(self.client.clone(), &namespace, &resource))
    }

    fn status_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &status_resource())
    }

    fn file_lock(&self) -> MutexGuard<'_, Option<NamedTempFile>> {
        match self.kubeconfig_file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Kubeconfig lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn status_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(STATUS_GROUP, STATUS_VERSION, STATUS_KIND))
}

async fn watch_status(
    api: Api<DynamicObject>,
    selector: String,
    target: SyncTarget,
    readiness: Arc<ReadinessEngine>,
    cancel: CancellationToken,
) {
    let cluster = target.cluster.to_string();
    let stream = watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .applied_objects();
    let mut stream = std::pin::pin!(stream);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Status watch for {} on {} cancelled", target.app, cluster);
                return;
            }
            next = stream.next() => next,
        };

        let object = match next {
            Some(Ok(object)) => object,
            Some(Err(e)) => {
                log::warn!("Status watch on {} failed: {}", cluster, e);
                continue;
            }
            None => return,
        };

        let report = serde_json::to_value(&object).and_then(serde_json::from_value::<ResourceStatusReport>);
        match report {
            Ok(report) => {
                if let Err(e) = readiness
                    .handle_resource_status_report(&target.instance_id, &target.app, &cluster, &report)
                    .await
                {
                    log::warn!("Status for {} on {} not recorded: {}", target.app, cluster, e);
                }
            }
            Err(e) => log::warn!("Malformed status CR on {}: {}", cluster, e),
        }
    }
}

/// Runs `op` until it stops failing with HTTP 409, at most `policy.steps`
/// times.
pub(crate) async fn retry_on_conflict<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, kube::Error>>,
{
    let steps = policy.steps.max(1);
    for attempt in 0..steps {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) => {
                log::debug!("Conflict writing {} (attempt {}/{})", what, attempt + 1, steps);
                if attempt + 1 < steps {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ProviderError::Conflict(what.to_string(), steps))
}

fn parse_manifest(content: &str) -> Result<(DynamicObject, GroupVersionKind)> {
    let object: DynamicObject = serde_yaml::from_str(content)
        .map_err(|e| ProviderError::InvalidManifest(e.to_string()))?;
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| ProviderError::InvalidManifest("missing apiVersion or kind".to_string()))?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    Ok((object, gvk))
}

fn manifest_name(object: &DynamicObject) -> Result<String> {
    object
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProviderError::InvalidManifest("missing metadata.name".to_string()))
}

/// Approval documents may omit `status`; it defaults to "True".
fn approval_condition(approval: &Value) -> Result<CertificateSigningRequestCondition> {
    let mut doc = approval.clone();
    let object = doc
        .as_object_mut()
        .ok_or_else(|| ProviderError::InvalidManifest("approval is not an object".to_string()))?;
    object
        .entry("status")
        .or_insert_with(|| Value::from("True"));
    serde_json::from_value(doc).map_err(|e| ProviderError::InvalidManifest(e.to_string()))
}
