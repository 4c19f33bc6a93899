//! Per-cluster status report produced by the monitor agent.
//!
//! The wire shape is the monitor's `ResourceBundleState` custom resource;
//! status entries are full Kubernetes objects.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

/// API group/version of the monitor's status resource.
pub const STATUS_API_VERSION: &str = "k8splugin.io/v1alpha1";
/// Kind of the monitor's status resource.
pub const STATUS_KIND: &str = "ResourceBundleState";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatusReport {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReportSpec,
    #[serde(default)]
    pub status: BundleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub resource_count: i32,
    #[serde(default)]
    pub pod_statuses: Vec<Pod>,
    #[serde(default)]
    pub service_statuses: Vec<Service>,
    #[serde(default)]
    pub deployment_statuses: Vec<Deployment>,
    #[serde(default)]
    pub daemon_set_statuses: Vec<DaemonSet>,
    #[serde(default)]
    pub job_statuses: Vec<Job>,
    #[serde(default)]
    pub stateful_set_statuses: Vec<StatefulSet>,
    #[serde(default)]
    pub csr_statuses: Vec<CertificateSigningRequest>,
    #[serde(default)]
    pub config_map_statuses: Vec<serde_json::Value>,
    #[serde(default)]
    pub secret_statuses: Vec<serde_json::Value>,
    #[serde(default)]
    pub resource_statuses: Vec<serde_json::Value>,
}

impl ResourceStatusReport {
    /// Decodes a YAML (or JSON) status document.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Numeric resource version of the report, when the monitor set one.
    pub fn revision(&self) -> Option<u64> {
        self.metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
    }

    /// Names of certificate signing requests that are neither approved
    /// nor denied.
    pub fn pending_certificate_requests(&self) -> Vec<String> {
        self.status
            .csr_statuses
            .iter()
            .filter(|csr| {
                let decided = csr
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
                    })
                    .unwrap_or(false);
                !decided
            })
            .filter_map(|csr| csr.metadata.name.clone())
            .collect()
    }
}
