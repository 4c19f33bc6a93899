//! Supervised background watches over cluster status.
//!
//! A [`WatchSupervisor`] owns one task per `(instance, app, cluster)`.
//! Git-backed providers run a [`StatusWatch`] in that task: poll the status
//! branch, hand new reports to the readiness engine, stop when the instance
//! disappears or the token is cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::{GitOpsError, Result};
use super::git::{ChangeSet, GitRepositoryEngine, PullOutcome};
use crate::context::{AppContext, ContextStore};
use crate::readiness::ReadinessEngine;

/// Maximum number of retries for transient pull errors within one tick.
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff (in seconds).
const RETRY_BASE_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub instance_id: String,
    pub app: String,
    pub cluster: String,
}

impl WatchKey {
    pub fn new(
        instance_id: impl Into<String>,
        app: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            app: app.into(),
            cluster: cluster.into(),
        }
    }
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts, tracks and stops watch tasks.
pub struct WatchSupervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<WatchKey, WatchHandle>>,
}

impl Default for WatchSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns `task` under `key` unless a live task already holds the key.
    ///
    /// The factory receives a token that fires on `cancel`, `cancel_instance`
    /// or `shutdown`. Returns false when the key was already running.
    pub fn start<F, Fut>(&self, key: WatchKey, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.task.is_finished());

        if tasks.contains_key(&key) {
            log::debug!(
                "Watch for {}/{} on {} already running",
                key.instance_id,
                key.app,
                key.cluster
            );
            return false;
        }

        let cancel = self.root.child_token();
        let span = tracing::info_span!(
            "status_watch",
            instance = %key.instance_id,
            app = %key.app,
            cluster = %key.cluster
        );
        let handle = tokio::spawn(task(cancel.clone()).instrument(span));
        tasks.insert(
            key,
            WatchHandle {
                cancel,
                task: handle,
            },
        );
        true
    }

    pub fn is_running(&self, key: &WatchKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Cancels one watch. Returns false if none was registered.
    pub fn cancel(&self, key: &WatchKey) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every watch of an instance and returns how many were stopped.
    pub fn cancel_instance(&self, instance_id: &str) -> usize {
        let mut tasks = self.lock();
        let keys: Vec<WatchKey> = tasks
            .keys()
            .filter(|k| k.instance_id == instance_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(handle) = tasks.remove(key) {
                handle.cancel.cancel();
            }
        }
        keys.len()
    }

    /// Number of live watches.
    pub fn running(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| !handle.task.is_finished())
            .count()
    }

    /// Cancels everything and waits for the tasks to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<WatchHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    log::warn!("Watch task ended abnormally: {}", e);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatchKey, WatchHandle>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Watch supervisor lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Where a status watch reads reports from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Polls for a report newer than `last_seen`.
    async fn poll(&self, last_seen: Option<&str>) -> Result<PullOutcome>;

    /// Removes the status CR once the instance is gone.
    async fn remove_status(&self) -> Result<()>;
}

/// Status reports pushed by the cluster monitor to the `<cluster>` branch.
pub struct GitStatusSource {
    engine: Arc<GitRepositoryEngine>,
    status_branch: String,
    status_path: String,
    cr_branch: String,
    cr_path: String,
}

impl GitStatusSource {
    /// `status_path` is read from `status_branch`; `cr_path` on `cr_branch`
    /// is the status CR to delete on cleanup.
    pub fn new(
        engine: Arc<GitRepositoryEngine>,
        status_branch: impl Into<String>,
        status_path: impl Into<String>,
        cr_branch: impl Into<String>,
        cr_path: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            status_branch: status_branch.into(),
            status_path: status_path.into(),
            cr_branch: cr_branch.into(),
            cr_path: cr_path.into(),
        }
    }
}

#[async_trait]
impl StatusSource for GitStatusSource {
    async fn poll(&self, last_seen: Option<&str>) -> Result<PullOutcome> {
        self.engine
            .pull_and_diff(&self.status_branch, &self.status_path, last_seen)
            .await
    }

    async fn remove_status(&self) -> Result<()> {
        let mut changes = ChangeSet::new();
        changes.delete(self.cr_path.clone());
        self.engine
            .commit_files(
                &self.cr_branch,
                &format!("Commit for {}", self.cr_path),
                &changes,
            )
            .await
            .map(|_| ())
    }
}

/// The poll loop for one `(instance, app, cluster)`.
pub struct StatusWatch<S> {
    key: WatchKey,
    source: S,
    store: Arc<dyn ContextStore>,
    readiness: Arc<ReadinessEngine>,
    interval: Duration,
}

impl<S: StatusSource + 'static> StatusWatch<S> {
    pub fn new(
        key: WatchKey,
        source: S,
        store: Arc<dyn ContextStore>,
        readiness: Arc<ReadinessEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            key,
            source,
            store,
            readiness,
            interval,
        }
    }

    /// Runs until cancelled or until the instance is deleted.
    pub async fn run(self, cancel: CancellationToken) {
        let key = &self.key;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // skip immediate first tick

        let mut last_seen: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Watch for {} on {} cancelled", key.app, key.cluster);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match AppContext::exists(self.store.as_ref(), &key.instance_id).await {
                Ok(true) => {}
                Ok(false) => {
                    log::info!(
                        "Instance {} is gone, stopping watch for {} on {}",
                        key.instance_id,
                        key.app,
                        key.cluster
                    );
                    if let Err(e) = self.source.remove_status().await {
                        log::warn!("Failed to remove status CR for {}: {}", key.app, e);
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("Could not check instance {}: {}", key.instance_id, e);
                    continue;
                }
            }

            let outcome = match self.poll_with_retry(&cancel, last_seen.as_deref()).await {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => {
                    log::warn!("Status poll for {} on {} failed: {}", key.app, key.cluster, e);
                    continue;
                }
                None => return,
            };

            if let Some(document) = outcome.document.as_deref() {
                if let Err(e) = self
                    .readiness
                    .handle_status_document(&key.instance_id, &key.app, &key.cluster, document)
                    .await
                {
                    log::warn!(
                        "Status report for {} on {} not recorded: {}",
                        key.app,
                        key.cluster,
                        e
                    );
                    continue;
                }
            }

            if outcome.commit_id.is_some() {
                last_seen = outcome.commit_id;
            }
        }
    }

    /// Returns None when cancelled while backing off.
    async fn poll_with_retry(
        &self,
        cancel: &CancellationToken,
        last_seen: Option<&str>,
    ) -> Option<Result<PullOutcome>> {
        let mut last_error: Option<GitOpsError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY_SECS * (1 << (attempt - 1)); // 2s, 4s, 8s
                log::info!(
                    "Retrying status poll (attempt {}/{}) after {}s...",
                    attempt + 1,
                    MAX_RETRIES + 1,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                }
            }

            match self.source.poll(last_seen).await {
                Ok(outcome) => return Some(Ok(outcome)),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    log::warn!("Status poll failed with retryable error: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Some(Err(e)),
            }
        }

        Some(Err(last_error.unwrap_or_else(|| {
            GitOpsError::GitOperation("Status poll failed after all retries".to_string())
        })))
    }
}
