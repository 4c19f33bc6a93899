//! Handle-based accessor over one composite-app instance.
//!
//! Layout of the keys below the instance root:
//!
//! ```text
//! /context/<id>/                                   instance root
//! /context/<id>/meta/                              CompositeAppMeta
//! /context/<id>/instruction/<order|dependency>/    app-level instructions
//! /context/<id>/app/<app>/                         app handle
//! /context/<id>/app/<app>/cluster/<key>/           cluster handle
//! /context/<id>/app/<app>/cluster/<key>/resource/<name>/
//! <any handle><level>/                             level value
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::error::{ContextError, Result};
use super::store::ContextStore;
use super::types::{AppContextStatus, CompositeAppMeta, InstructionKind};

const CONTEXT_PREFIX: &str = "/context/";
const META_LEVEL: &str = "meta";
const STATUS_LEVEL: &str = "status";

/// Opaque address of a node or level value in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    fn new(key: String) -> Self {
        debug_assert!(key.ends_with('/'));
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn child(&self, segment: &str, name: &str) -> Handle {
        Handle::new(format!("{}{}/{}/", self.0, segment, name))
    }

    pub(crate) fn level(&self, level: &str) -> Handle {
        Handle::new(format!("{}{}/", self.0, level))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One composite-app instance in the desired-state tree.
#[derive(Clone)]
pub struct AppContext {
    store: Arc<dyn ContextStore>,
    id: String,
    root: Handle,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext").field("id", &self.id).finish()
    }
}

fn root_handle(id: &str) -> Handle {
    Handle::new(format!("{}{}/", CONTEXT_PREFIX, id))
}

fn new_instance_id() -> String {
    // Positive 63-bit integer rendered as decimal.
    let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
    (high >> 1).to_string()
}

impl AppContext {
    /// Creates a new instance with a generated id.
    pub async fn create(store: Arc<dyn ContextStore>, meta: &CompositeAppMeta) -> Result<Self> {
        Self::create_with_id(store, &new_instance_id(), meta).await
    }

    /// Creates a new instance under a caller-chosen id.
    pub async fn create_with_id(
        store: Arc<dyn ContextStore>,
        id: &str,
        meta: &CompositeAppMeta,
    ) -> Result<Self> {
        let root = root_handle(id);
        store.put(root.as_str(), Value::String(id.to_string())).await?;
        store
            .put(root.level(META_LEVEL).as_str(), serde_json::to_value(meta)?)
            .await?;
        Ok(Self {
            store,
            id: id.to_string(),
            root,
        })
    }

    /// Opens an existing instance. Fails with `NotFound` if it was never
    /// created or has been deleted.
    pub async fn load(store: Arc<dyn ContextStore>, id: &str) -> Result<Self> {
        let root = root_handle(id);
        if !store.contains(root.as_str()).await? {
            return Err(ContextError::NotFound(format!("instance {}", id)));
        }
        Ok(Self {
            store,
            id: id.to_string(),
            root,
        })
    }

    /// Returns true if the instance root exists.
    pub async fn exists(store: &dyn ContextStore, id: &str) -> Result<bool> {
        store.contains(root_handle(id).as_str()).await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Handle {
        &self.root
    }

    pub(crate) fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    /// Removes the whole instance subtree.
    pub async fn delete(&self) -> Result<()> {
        self.store.delete_prefix(self.root.as_str()).await
    }

    pub async fn get_composite_app_meta(&self) -> Result<CompositeAppMeta> {
        self.get_value_as(&self.root.level(META_LEVEL)).await
    }

    pub async fn get_status(&self) -> Result<Option<AppContextStatus>> {
        match self.get_value_as(&self.root.level(STATUS_LEVEL)).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn update_status(&self, status: AppContextStatus) -> Result<()> {
        self.store
            .put(
                self.root.level(STATUS_LEVEL).as_str(),
                serde_json::to_value(status)?,
            )
            .await
    }

    // ─── Apps, clusters, resources ───────────────────────────────────────

    pub async fn add_app(&self, app: &str) -> Result<Handle> {
        let handle = self.root.child("app", app);
        self.store
            .put(handle.as_str(), Value::String(app.to_string()))
            .await?;
        Ok(handle)
    }

    pub async fn get_app_handle(&self, app: &str) -> Result<Handle> {
        self.existing(self.root.child("app", app)).await
    }

    pub async fn add_cluster(&self, app_handle: &Handle, cluster: &str) -> Result<Handle> {
        let handle = app_handle.child("cluster", cluster);
        self.store
            .put(handle.as_str(), Value::String(cluster.to_string()))
            .await?;
        Ok(handle)
    }

    pub async fn get_cluster_handle(&self, app: &str, cluster: &str) -> Result<Handle> {
        let app_handle = self.get_app_handle(app).await?;
        self.existing(app_handle.child("cluster", cluster)).await
    }

    /// Adds a resource definition under a cluster handle.
    pub async fn add_resource(
        &self,
        cluster_handle: &Handle,
        name: &str,
        definition: &str,
    ) -> Result<Handle> {
        let handle = cluster_handle.child("resource", name);
        self.store
            .put(handle.as_str(), Value::String(definition.to_string()))
            .await?;
        Ok(handle)
    }

    pub async fn get_resource_handle(
        &self,
        app: &str,
        cluster: &str,
        name: &str,
    ) -> Result<Handle> {
        let cluster_handle = self.get_cluster_handle(app, cluster).await?;
        self.existing(cluster_handle.child("resource", name)).await
    }

    pub async fn get_app_names(&self) -> Result<Vec<String>> {
        self.child_names(&format!("{}app/", self.root)).await
    }

    pub async fn get_cluster_names(&self, app: &str) -> Result<Vec<String>> {
        let app_handle = self.get_app_handle(app).await?;
        self.child_names(&format!("{}cluster/", app_handle)).await
    }

    pub async fn get_resource_names(&self, app: &str, cluster: &str) -> Result<Vec<String>> {
        let cluster_handle = self.get_cluster_handle(app, cluster).await?;
        self.child_names(&format!("{}resource/", cluster_handle))
            .await
    }

    // ─── Instructions ────────────────────────────────────────────────────

    /// Stores an instruction document under `handle`.
    pub async fn add_instruction(
        &self,
        handle: &Handle,
        kind: InstructionKind,
        value: Value,
    ) -> Result<Handle> {
        let handle = handle.child("instruction", kind.as_str());
        self.store.put(handle.as_str(), value).await?;
        Ok(handle)
    }

    pub async fn get_app_instruction(&self, kind: InstructionKind) -> Result<Value> {
        let handle = self.root.child("instruction", kind.as_str());
        self.get_value(&handle).await
    }

    pub async fn get_resource_instruction(
        &self,
        app: &str,
        cluster: &str,
        kind: InstructionKind,
    ) -> Result<Value> {
        let cluster_handle = self.get_cluster_handle(app, cluster).await?;
        self.get_value(&cluster_handle.child("instruction", kind.as_str()))
            .await
    }

    // ─── Level values ────────────────────────────────────────────────────

    /// Adds (or overwrites) a level value below `handle`.
    pub async fn add_level_value(
        &self,
        handle: &Handle,
        level: &str,
        value: Value,
    ) -> Result<Handle> {
        let level_handle = handle.level(level);
        self.store.put(level_handle.as_str(), value).await?;
        Ok(level_handle)
    }

    /// Returns the handle of an existing level value.
    pub async fn get_level_handle(&self, handle: &Handle, level: &str) -> Result<Handle> {
        self.existing(handle.level(level)).await
    }

    /// Replaces the value of an existing level. Fails with `NotFound`
    /// instead of creating the level.
    pub async fn update_status_value(&self, level_handle: &Handle, value: Value) -> Result<()> {
        if !self.store.contains(level_handle.as_str()).await? {
            return Err(ContextError::NotFound(level_handle.to_string()));
        }
        self.store.put(level_handle.as_str(), value).await
    }

    /// Writes a level value whether or not it already exists.
    pub async fn upsert_level_value<T: Serialize>(
        &self,
        handle: &Handle,
        level: &str,
        value: &T,
    ) -> Result<Handle> {
        self.add_level_value(handle, level, serde_json::to_value(value)?)
            .await
    }

    pub async fn get_value(&self, handle: &Handle) -> Result<Value> {
        self.store.get(handle.as_str()).await
    }

    pub async fn get_value_as<T: DeserializeOwned>(&self, handle: &Handle) -> Result<T> {
        let value = self.get_value(handle).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ─── Private helpers ─────────────────────────────────────────────────

    async fn existing(&self, handle: Handle) -> Result<Handle> {
        if self.store.contains(handle.as_str()).await? {
            Ok(handle)
        } else {
            Err(ContextError::NotFound(handle.to_string()))
        }
    }

    async fn child_names(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.store.keys_with_prefix(prefix).await?;
        let names: BTreeSet<String> = keys
            .iter()
            .filter_map(|k| k[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }
}
