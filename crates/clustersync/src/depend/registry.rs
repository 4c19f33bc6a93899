//! Process-local map of dependency managers keyed by instance id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::manager::DependencyManager;

/// Owns one [`DependencyManager`] per deployment instance.
#[derive(Default)]
pub struct DependencyRegistry {
    managers: Mutex<HashMap<String, Arc<DependencyManager>>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, instance_id: &str) -> Arc<DependencyManager> {
        let mut managers = self.lock();
        Arc::clone(
            managers
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(DependencyManager::new(instance_id))),
        )
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<DependencyManager>> {
        self.lock().get(instance_id).cloned()
    }

    /// Drops the manager of `instance_id`, ending any wait still pending on
    /// it. Returns false if there was none.
    pub fn remove(&self, instance_id: &str) -> bool {
        let removed = self.lock().remove(instance_id);
        match removed {
            Some(manager) => {
                manager.tear_down();
                log::debug!("Removed dependency registry of instance {}", instance_id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Releases criteria waiting for `app` to become ready.
    pub async fn resources_ready(&self, instance_id: &str, app: &str) {
        if let Some(manager) = self.get(instance_id) {
            manager.notify_ready(app).await;
        }
    }

    /// Releases criteria waiting for `app` to be deployed.
    pub async fn resources_deployed(&self, instance_id: &str, app: &str) {
        if let Some(manager) = self.get(instance_id) {
            manager.notify_deployed(app).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DependencyManager>>> {
        match self.managers.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Dependency registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
