//! Labelling of manifests before they are pushed.

use serde_yaml::{Mapping, Value};

use super::error::{ProviderError, Result};

/// Kinds whose objects carry a pod template under `spec.template`.
const POD_TEMPLATE_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "Job", "ReplicaSet"];

/// Kinds that live outside any namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "CertificateSigningRequest",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Sets `label_key: label` on the object and on its pod template, if the
/// kind has one.
///
/// With `namespace` set, a namespaced object without `metadata.namespace`
/// is placed in that namespace.
pub fn tag_manifest(
    content: &str,
    label_key: &str,
    label: &str,
    namespace: Option<&str>,
) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(content)
        .map_err(|e| ProviderError::InvalidManifest(e.to_string()))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| ProviderError::InvalidManifest("manifest is not a mapping".to_string()))?;

    let kind = root
        .get("kind")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidManifest("manifest has no kind".to_string()))?;

    let metadata = child_mapping(root, "metadata")?;
    set_label(metadata, label_key, label)?;

    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        if !is_cluster_scoped(&kind) && !metadata.contains_key("namespace") {
            metadata.insert(Value::from("namespace"), Value::from(ns));
        }
    }

    if POD_TEMPLATE_KINDS.contains(&kind.as_str()) {
        let spec = child_mapping(root, "spec")?;
        let template = child_mapping(spec, "template")?;
        let template_meta = child_mapping(template, "metadata")?;
        set_label(template_meta, label_key, label)?;
    }

    serde_yaml::to_string(&doc).map_err(|e| ProviderError::InvalidManifest(e.to_string()))
}

fn set_label(metadata: &mut Mapping, key: &str, value: &str) -> Result<()> {
    let labels = child_mapping(metadata, "labels")?;
    labels.insert(Value::from(key), Value::from(value));
    Ok(())
}

/// Returns the mapping under `key`, creating it if absent or null.
fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let entry = parent
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry
        .as_mapping_mut()
        .ok_or_else(|| ProviderError::InvalidManifest(format!("'{}' is not a mapping", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABEL: &str = "emco/deployment-id";

    fn parse(out: &str) -> Value {
        serde_yaml::from_str(out).unwrap()
    }

    #[test]
    fn test_deployment_and_template_are_labelled() {
        let manifest = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  template:\n    metadata:\n      labels:\n        app: web\n";
        let out = parse(&tag_manifest(manifest, LABEL, "42-web", None).unwrap());

        assert_eq!(out["metadata"]["labels"][LABEL], "42-web");
        assert_eq!(out["spec"]["template"]["metadata"]["labels"][LABEL], "42-web");
        assert_eq!(out["spec"]["template"]["metadata"]["labels"]["app"], "web");
        assert!(out["metadata"].get("namespace").is_none());
    }

    #[test]
    fn test_namespace_only_fills_gaps() {
        let service = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n";
        let out = parse(&tag_manifest(service, LABEL, "42-web", Some("apps")).unwrap());
        assert_eq!(out["metadata"]["namespace"], "apps");
        assert!(out.get("spec").is_none());

        let pinned = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n  namespace: kept\n";
        let out = parse(&tag_manifest(pinned, LABEL, "42-web", Some("apps")).unwrap());
        assert_eq!(out["metadata"]["namespace"], "kept");

        let ns = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: apps\n";
        let out = parse(&tag_manifest(ns, LABEL, "42-web", Some("apps")).unwrap());
        assert!(out["metadata"].get("namespace").is_none());
    }

    #[test]
    fn test_malformed_manifest() {
        assert!(matches!(
            tag_manifest("- just\n- a list\n", LABEL, "x", None),
            Err(ProviderError::InvalidManifest(_))
        ));
        assert!(matches!(
            tag_manifest("metadata: {}\n", LABEL, "x", None),
            Err(ProviderError::InvalidManifest(_))
        ));
    }
}
