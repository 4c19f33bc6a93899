//! Lookup of per-cluster sync configuration and credential bundles.
//!
//! The records are created by operators through an external API; the
//! engine only reads them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::error::{ProviderError, Result};
use crate::sanitize::bundle_keys;
use crate::secrets::resolve_secret_optional;

/// GitOps record of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsConfig {
    /// Selects the provider variant.
    pub gitops_type: String,
    /// Bundle holding the git credentials.
    pub reference_object: String,
    /// Bundle holding cloud credentials and timings, for variants that
    /// need one.
    #[serde(default)]
    pub resource_object: Option<String>,
}

impl GitOpsConfig {
    pub fn new(gitops_type: impl Into<String>, reference_object: impl Into<String>) -> Self {
        Self {
            gitops_type: gitops_type.into(),
            reference_object: reference_object.into(),
            resource_object: None,
        }
    }

    pub fn with_resource_object(mut self, name: impl Into<String>) -> Self {
        self.resource_object = Some(name.into());
        self
    }
}

/// A named key-value credential bundle.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvBundle {
    #[serde(flatten)]
    values: BTreeMap<String, String>,
}

impl fmt::Debug for KvBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvBundle")
            .field("keys", &bundle_keys(self.values.keys()))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KvBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl KvBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Value of `key`, treating an empty string as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Like [`get`](Self::get), but a missing key is a configuration error
    /// naming the cluster.
    pub fn require(&self, cluster: &str, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| ProviderError::missing(cluster, format!("bundle has no '{}'", key)))
    }

    /// Resolves a secret stored inline as `key`, or indirectly as
    /// `<key>File` or `<key>EnvVar`.
    pub fn secret(&self, key: &str) -> Result<Option<SecretString>> {
        let file_key = format!("{}File", key);
        let env_key = format!("{}EnvVar", key);
        Ok(resolve_secret_optional(
            self.get(key),
            self.get(&file_key),
            self.get(&env_key),
        )?)
    }

    pub fn require_secret(&self, cluster: &str, key: &str) -> Result<SecretString> {
        self.secret(key)?
            .ok_or_else(|| ProviderError::missing(cluster, format!("bundle has no '{}'", key)))
    }

    /// Numeric value with a fallback used when the key is absent.
    pub fn seconds_or(&self, cluster: &str, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                ProviderError::missing(cluster, format!("'{}' is not a number: {}", key, raw))
            }),
        }
    }
}

/// Reconciliation timings of a GitOps agent, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    pub timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub retry_interval_secs: u64,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            sync_interval_secs: 60,
            retry_interval_secs: 60,
        }
    }
}

impl SyncTimings {
    /// Reads `timeOut`, `syncInterval` and `retryInterval`; absent keys keep
    /// their defaults.
    pub fn from_bundle(cluster: &str, bundle: &KvBundle) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            timeout_secs: bundle.seconds_or(cluster, "timeOut", defaults.timeout_secs)?,
            sync_interval_secs: bundle.seconds_or(
                cluster,
                "syncInterval",
                defaults.sync_interval_secs,
            )?,
            retry_interval_secs: bundle.seconds_or(
                cluster,
                "retryInterval",
                defaults.retry_interval_secs,
            )?,
        })
    }
}

/// Read side of the cluster sync configuration store.
#[async_trait]
pub trait CloudConfigStore: Send + Sync {
    /// Base64-encoded kubeconfig for direct access, if one is stored.
    async fn get_kubeconfig(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Option<String>>;

    async fn get_gitops_config(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Option<GitOpsConfig>>;

    /// Named credential bundle of a cluster provider.
    async fn get_sync_object(&self, provider: &str, name: &str) -> Result<Option<KvBundle>>;
}

type ScopeKey = (String, String, String, String);

fn scope_key(provider: &str, cluster: &str, level: &str, namespace: &str) -> ScopeKey {
    // Level "0" records are cluster-wide; the namespace does not apply.
    let namespace = if level == "0" { "" } else { namespace };
    (
        provider.to_string(),
        cluster.to_string(),
        level.to_string(),
        namespace.to_string(),
    )
}

/// In-process [`CloudConfigStore`].
#[derive(Default)]
pub struct MemoryCloudConfigStore {
    kubeconfigs: RwLock<HashMap<ScopeKey, String>>,
    gitops: RwLock<HashMap<ScopeKey, GitOpsConfig>>,
    sync_objects: RwLock<HashMap<(String, String), KvBundle>>,
}

impl MemoryCloudConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_kubeconfig(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
        kubeconfig_b64: impl Into<String>,
    ) {
        self.kubeconfigs
            .write()
            .await
            .insert(scope_key(provider, cluster, level, namespace), kubeconfig_b64.into());
    }

    pub async fn put_gitops_config(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
        config: GitOpsConfig,
    ) {
        self.gitops
            .write()
            .await
            .insert(scope_key(provider, cluster, level, namespace), config);
    }

    pub async fn put_sync_object(&self, provider: &str, name: &str, bundle: KvBundle) {
        self.sync_objects
            .write()
            .await
            .insert((provider.to_string(), name.to_string()), bundle);
    }
}

#[async_trait]
impl CloudConfigStore for MemoryCloudConfigStore {
    async fn get_kubeconfig(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .kubeconfigs
            .read()
            .await
            .get(&scope_key(provider, cluster, level, namespace))
            .cloned())
    }

    async fn get_gitops_config(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Option<GitOpsConfig>> {
        Ok(self
            .gitops
            .read()
            .await
            .get(&scope_key(provider, cluster, level, namespace))
            .cloned())
    }

    async fn get_sync_object(&self, provider: &str, name: &str) -> Result<Option<KvBundle>> {
        Ok(self
            .sync_objects
            .read()
            .await
            .get(&(provider.to_string(), name.to_string()))
            .cloned())
    }
}
