//! Value types stored in the desired-state tree.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::depend::DependencyCriteria;

/// Metadata attached to the root of a composite-app instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAppMeta {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub composite_app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub deployment_intent_group: String,
    #[serde(default)]
    pub namespace: String,
    /// Logical-cloud level of the deployment ("0" is cluster-wide).
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, rename = "childContextIDs")]
    pub child_context_ids: Vec<String>,
    #[serde(default)]
    pub logical_cloud: String,
    #[serde(default)]
    pub logical_cloud_namespace: String,
    #[serde(default = "default_level")]
    pub logical_cloud_level: String,
}

fn default_level() -> String {
    "0".to_string()
}

/// Lifecycle status of a composite-app instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppContextStatus {
    Instantiating,
    Instantiated,
    Terminating,
    Terminated,
    InstantiateFailed,
    TerminateFailed,
    Created,
    Updating,
    Updated,
    UpdateFailed,
}

impl fmt::Display for AppContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppContextStatus::Instantiating => "Instantiating",
            AppContextStatus::Instantiated => "Instantiated",
            AppContextStatus::Terminating => "Terminating",
            AppContextStatus::Terminated => "Terminated",
            AppContextStatus::InstantiateFailed => "InstantiateFailed",
            AppContextStatus::TerminateFailed => "TerminateFailed",
            AppContextStatus::Created => "Created",
            AppContextStatus::Updating => "Updating",
            AppContextStatus::Updated => "Updated",
            AppContextStatus::UpdateFailed => "UpdateFailed",
        };
        f.write_str(s)
    }
}

/// Reachability of one cluster as last observed by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterReadyStatus {
    #[default]
    Unknown,
    Available,
    Retrying,
}

/// Instruction documents attached to apps and clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Order,
    Dependency,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::Order => "order",
            InstructionKind::Dependency => "dependency",
        }
    }
}

/// `{"apporder": [...]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppOrder {
    #[serde(rename = "apporder", default)]
    pub apps: Vec<String>,
}

/// `{"appdependency": {"<app>": [criteria...]}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppDependencies {
    #[serde(rename = "appdependency", default)]
    pub apps: BTreeMap<String, Vec<DependencyCriteria>>,
}

/// `{"resorder": [...]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceOrder {
    #[serde(rename = "resorder", default)]
    pub resources: Vec<String>,
}

/// `{"resdependency": {"<resource>": "<instruction>"}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDependencies {
    #[serde(rename = "resdependency", default)]
    pub resources: BTreeMap<String, String>,
}

/// Logical cloud the instance deploys into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalCloudInfo {
    pub name: String,
    pub namespace: String,
    pub level: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depend::WaitKind;

    #[test]
    fn test_meta_defaults_levels() {
        let meta: CompositeAppMeta = serde_json::from_str(r#"{"project":"p"}"#).unwrap();
        assert_eq!(meta.level, "0");
        assert_eq!(meta.logical_cloud_level, "0");
        assert!(meta.child_context_ids.is_empty());
    }

    #[test]
    fn test_app_dependency_document() {
        let doc = r#"{"appdependency":{"web":[{"app":"db","opStatus":"Ready","wait":5}]}}"#;
        let deps: AppDependencies = serde_json::from_str(doc).unwrap();
        let web = &deps.apps["web"];
        assert_eq!(web[0].target_app, "db");
        assert_eq!(web[0].wait_kind, WaitKind::Ready);
        assert_eq!(web[0].settle_delay_secs, 5);
    }

    #[test]
    fn test_status_strings() {
        let json = serde_json::to_string(&AppContextStatus::InstantiateFailed).unwrap();
        assert_eq!(json, "\"InstantiateFailed\"");
        assert_eq!(AppContextStatus::Terminated.to_string(), "Terminated");
    }
}
