//! Builders for instances, manifests and status reports.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use clustersync::context::{CompositeAppMeta, InstructionKind};
use clustersync::{AppContext, ContextStore, DependencyCriteria, ResourceStatusReport, WaitKind};

struct AppSpec {
    name: String,
    clusters: Vec<String>,
    resources: Vec<(String, String)>,
}

/// Builds a deployment instance in the tree.
pub struct InstanceBuilder {
    id: String,
    meta: CompositeAppMeta,
    apps: Vec<AppSpec>,
    dependencies: BTreeMap<String, Vec<DependencyCriteria>>,
}

impl InstanceBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            meta: CompositeAppMeta {
                project: "proj".to_string(),
                composite_app: "shop".to_string(),
                namespace: "apps".to_string(),
                level: "0".to_string(),
                ..Default::default()
            },
            apps: Vec::new(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.meta.namespace = namespace.to_string();
        self
    }

    /// Adds `app` on `clusters`, each receiving `resources` in order.
    pub fn app(mut self, name: &str, clusters: &[&str], resources: &[(&str, String)]) -> Self {
        self.apps.push(AppSpec {
            name: name.to_string(),
            clusters: clusters.iter().map(|c| c.to_string()).collect(),
            resources: resources
                .iter()
                .map(|(n, c)| (n.to_string(), c.clone()))
                .collect(),
        });
        self
    }

    pub fn depends(mut self, app: &str, target: &str, kind: WaitKind) -> Self {
        self.dependencies
            .entry(app.to_string())
            .or_default()
            .push(DependencyCriteria::new(target, kind));
        self
    }

    pub async fn build(self, store: &Arc<dyn ContextStore>) -> AppContext {
        let ctx = AppContext::create_with_id(store.clone(), &self.id, &self.meta)
            .await
            .expect("create instance");

        let order: Vec<&str> = self.apps.iter().map(|a| a.name.as_str()).collect();
        ctx.add_instruction(ctx.root(), InstructionKind::Order, json!({ "apporder": order }))
            .await
            .expect("app order");
        ctx.add_instruction(
            ctx.root(),
            InstructionKind::Dependency,
            json!({ "appdependency": self.dependencies }),
        )
        .await
        .expect("app dependency");

        for app in &self.apps {
            let app_handle = ctx.add_app(&app.name).await.expect("add app");
            for cluster in &app.clusters {
                let handle = ctx.add_cluster(&app_handle, cluster).await.expect("add cluster");
                for (name, content) in &app.resources {
                    ctx.add_resource(&handle, name, content)
                        .await
                        .expect("add resource");
                }
                let names: Vec<&str> = app.resources.iter().map(|(n, _)| n.as_str()).collect();
                ctx.add_instruction(&handle, InstructionKind::Order, json!({ "resorder": names }))
                    .await
                    .expect("resource order");
            }
        }
        ctx
    }
}

pub fn deployment_manifest(name: &str) -> String {
    format!(
        "apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
        - name: {name}
          image: nginx
"
    )
}

pub fn service_manifest(name: &str) -> String {
    format!("apiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\nspec:\n  ports:\n    - port: 80\n")
}

/// A monitor report for one single-replica Deployment with `ready` ready
/// replicas.
pub fn deployment_report(name: &str, ready: i32) -> ResourceStatusReport {
    serde_json::from_value(json!({
        "apiVersion": "k8splugin.io/v1alpha1",
        "kind": "ResourceBundleState",
        "metadata": { "name": name },
        "status": {
            "ready": ready == 1,
            "resourceCount": 1,
            "deploymentStatuses": [{
                "metadata": { "name": name },
                "spec": {
                    "replicas": 1,
                    "selector": { "matchLabels": { "app": name } },
                    "template": { "metadata": { "labels": { "app": name } } }
                },
                "status": { "replicas": 1, "updatedReplicas": 1, "readyReplicas": ready }
            }]
        }
    }))
    .expect("valid report")
}
