//! Azure Arc provider.
//!
//! Resources travel through git like the plain provider. The Arc cluster
//! is told to pull them by a Flux configuration created through the Azure
//! Resource Manager API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ProviderError, Result};
use super::git::{load_bundle, GitProvider};
use super::lookup::{GitOpsConfig, SyncTimings};
use super::{ProviderEnv, SyncTarget};
use crate::config::AzureConfig;

const MANAGEMENT_RESOURCE: &str = "https://management.core.windows.net/";
const EXTENSION_API_VERSION: &str = "2021-09-01";
const FLUX_CONFIG_API_VERSION: &str = "2022-03-01";
const FLUX_CONFIG_DELETE_API_VERSION: &str = "2021-11-01-preview";

/// Maximum length of an error body kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn sanitize_error_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Service principal used against the management API.
#[derive(Clone)]
pub struct ArcCredentials {
    pub client_id: String,
    pub tenant_id: String,
    pub client_secret: SecretString,
}

/// The connected cluster a configuration belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcCluster {
    pub subscription_id: String,
    pub resource_group: String,
    pub cluster_name: String,
}

/// Minimal Azure Resource Manager client.
pub struct ArmClient {
    client: Client,
    login_url: String,
    management_url: String,
}

impl ArmClient {
    pub fn new(config: &AzureConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            login_url: with_trailing_slash(&config.login_url),
            management_url: with_trailing_slash(&config.management_url),
        })
    }

    pub fn token_url(&self, tenant_id: &str) -> String {
        format!("{}{}/oauth2/token", self.login_url, tenant_id)
    }

    fn configuration_url(&self, cluster: &ArcCluster) -> String {
        format!(
            "{}subscriptions/{}/resourceGroups/{}/providers/Microsoft.Kubernetes/connectedClusters/{}/providers/Microsoft.KubernetesConfiguration",
            self.management_url, cluster.subscription_id, cluster.resource_group, cluster.cluster_name
        )
    }

    pub fn extension_url(&self, cluster: &ArcCluster) -> String {
        format!(
            "{}/extensions/flux?api-version={}",
            self.configuration_url(cluster),
            EXTENSION_API_VERSION
        )
    }

    pub fn flux_configuration_url(&self, cluster: &ArcCluster, name: &str, api_version: &str) -> String {
        format!(
            "{}/fluxConfigurations/{}?api-version={}",
            self.configuration_url(cluster),
            name,
            api_version
        )
    }

    /// Client-credentials grant for the management resource.
    pub async fn access_token(&self, credentials: &ArcCredentials) -> Result<SecretString> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose_secret()),
            ("resource", MANAGEMENT_RESOURCE),
        ];
        let response = self
            .client
            .post(self.token_url(&credentials.tenant_id))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::CloudApi(format!(
                "Token request failed ({}): {}",
                status,
                sanitize_error_body(&body)
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(SecretString::from(token.access_token))
    }

    pub async fn install_flux_extension(&self, token: &SecretString, cluster: &ArcCluster) -> Result<()> {
        let body = json!({
            "identity": { "type": "SystemAssigned" },
            "properties": {
                "extensionType": "microsoft.flux",
                "autoUpgradeMinorVersion": true,
            },
        });
        let request = self.client.put(self.extension_url(cluster)).json(&body);
        self.send(request, token, "Flux extension installation").await
    }

    pub async fn put_flux_configuration(
        &self,
        token: &SecretString,
        cluster: &ArcCluster,
        name: &str,
        body: &Value,
    ) -> Result<()> {
        let url = self.flux_configuration_url(cluster, name, FLUX_CONFIG_API_VERSION);
        let request = self.client.put(url).json(body);
        self.send(request, token, "Flux configuration").await
    }

    pub async fn delete_flux_configuration(
        &self,
        token: &SecretString,
        cluster: &ArcCluster,
        name: &str,
    ) -> Result<()> {
        let url = self.flux_configuration_url(cluster, name, FLUX_CONFIG_DELETE_API_VERSION);
        let request = self.client.delete(url);
        self.send(request, token, "Flux configuration deletion").await
    }

    async fn send(&self, request: RequestBuilder, token: &SecretString, what: &str) -> Result<()> {
        let response = request.bearer_auth(token.expose_secret()).send().await?;
        let status = response.status();
        if status.is_success() {
            log::debug!("{} accepted ({})", what, status);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::CloudApi(format!(
            "{} failed ({}): {}",
            what,
            status,
            sanitize_error_body(&body)
        )))
    }
}

pub struct AzureArcProvider {
    git: GitProvider,
    credentials: ArcCredentials,
    cluster: ArcCluster,
    timings: SyncTimings,
    arm: Arc<ArmClient>,
}

impl AzureArcProvider {
    pub async fn new(env: &ProviderEnv, target: SyncTarget, gitops: &GitOpsConfig) -> Result<Self> {
        let cluster_key = target.cluster.to_string();
        let arm = env
            .arm
            .clone()
            .ok_or_else(|| ProviderError::missing(&cluster_key, "no Azure management client"))?;
        let resource_object = gitops.resource_object.as_deref().ok_or_else(|| {
            ProviderError::missing(&cluster_key, "GitOps config has no resource object")
        })?;
        let bundle = load_bundle(env, &target, resource_object).await?;

        let credentials = ArcCredentials {
            client_id: bundle.require(&cluster_key, "clientID")?.to_string(),
            tenant_id: bundle.require(&cluster_key, "tenantID")?.to_string(),
            client_secret: bundle.require_secret(&cluster_key, "clientSecret")?,
        };
        let cluster = ArcCluster {
            subscription_id: bundle.require(&cluster_key, "subscriptionID")?.to_string(),
            resource_group: bundle.require(&cluster_key, "arcResourceGroup")?.to_string(),
            cluster_name: bundle.require(&cluster_key, "arcCluster")?.to_string(),
        };
        let timings = SyncTimings::from_bundle(&cluster_key, &bundle)?;

        Ok(Self {
            git: GitProvider::new(env, target, gitops).await?,
            credentials,
            cluster,
            timings,
            arm,
        })
    }

    pub fn git(&self) -> &GitProvider {
        &self.git
    }

    /// Name and scope of the Flux configuration for this deployment.
    pub fn configuration_name(&self) -> (String, &'static str) {
        let target = self.git.target();
        if target.level == "0" {
            (format!("config-{}", target.instance_id), "cluster")
        } else {
            (target.namespace.clone(), "namespace")
        }
    }

    pub fn flux_configuration(&self, scope: &str) -> Value {
        let target = self.git.target();
        json!({
            "properties": {
                "scope": scope,
                "namespace": target.namespace,
                "sourceKind": "GitRepository",
                "suspend": false,
                "gitRepository": {
                    "url": self.git.url(),
                    "repositoryRef": { "branch": self.git.branch() },
                },
                "kustomizations": {
                    "kustomization-1": {
                        "path": format!("clusters/{}/context/{}", target.cluster, target.instance_id),
                        "timeoutInSeconds": self.timings.timeout_secs,
                        "syncIntervalInSeconds": self.timings.sync_interval_secs,
                        "retryIntervalInSeconds": self.timings.retry_interval_secs,
                        "prune": true,
                        "force": false,
                    },
                },
            },
        })
    }

    pub async fn apply_config(&self) -> Result<()> {
        let token = self.arm.access_token(&self.credentials).await?;
        self.arm.install_flux_extension(&token, &self.cluster).await?;

        let (name, scope) = self.configuration_name();
        let body = self.flux_configuration(scope);
        self.arm
            .put_flux_configuration(&token, &self.cluster, &name, &body)
            .await?;
        log::info!(
            "Flux configuration {} applied to Arc cluster {}",
            name,
            self.cluster.cluster_name
        );
        Ok(())
    }

    pub async fn delete_config(&self) -> Result<()> {
        let token = self.arm.access_token(&self.credentials).await?;
        let (name, _) = self.configuration_name();
        self.arm
            .delete_flux_configuration(&token, &self.cluster, &name)
            .await?;
        log::info!(
            "Flux configuration {} removed from Arc cluster {}",
            name,
            self.cluster.cluster_name
        );
        Ok(())
    }
}
