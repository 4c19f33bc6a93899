//! Isolated engine environment backed by a local bare repository.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use clustersync::{
    BroadcastNotifier, ContextStore, EngineConfig, GitOpsConfig, KvBundle, MemoryCloudConfigStore,
    MemoryContextStore, SyncEngine,
};

/// Cluster provider every harness cluster belongs to.
pub const PROVIDER: &str = "edge";
/// Name of the git credential bundle.
pub const GIT_BUNDLE: &str = "gitref";

pub struct TestHarness {
    temp_dir: TempDir,
    pub remote: PathBuf,
    pub store: Arc<dyn ContextStore>,
    pub cloud: Arc<MemoryCloudConfigStore>,
    pub notifier: BroadcastNotifier,
    pub engine: Arc<SyncEngine>,
}

impl TestHarness {
    /// Engine with plain git records for clusters `c1` and `c2`.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let remote = init_bare_remote(temp_dir.path());

        let cloud = Arc::new(MemoryCloudConfigStore::new());
        let bundle: KvBundle = [
            ("gitType", "github"),
            ("userName", "tester"),
            ("repoName", "deploy"),
            ("branch", "main"),
            ("gitToken", "secret-token"),
            ("url", remote.to_str().expect("utf-8 temp path")),
        ]
        .into_iter()
        .collect();
        cloud.put_sync_object(PROVIDER, GIT_BUNDLE, bundle).await;
        for cluster in ["c1", "c2"] {
            cloud
                .put_gitops_config(PROVIDER, cluster, "0", "", GitOpsConfig::new("git", GIT_BUNDLE))
                .await;
        }

        let store: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::new());
        let notifier = BroadcastNotifier::new(64);
        let config = EngineConfig {
            work_dir: temp_dir.path().join("work"),
            ..Default::default()
        };
        let engine = Arc::new(SyncEngine::new(
            config,
            store.clone(),
            cloud.clone(),
            Arc::new(notifier.clone()),
        ));

        Self {
            temp_dir,
            remote,
            store,
            cloud,
            notifier,
            engine,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Files on the remote's `main` branch, one per line.
    pub fn remote_files(&self) -> String {
        let out = Command::new("git")
            .args(["ls-tree", "-r", "--name-only", "main"])
            .current_dir(&self.remote)
            .output()
            .expect("git ls-tree");
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    pub fn remote_file(&self, path: &str) -> Option<String> {
        let out = Command::new("git")
            .args(["show", &format!("main:{}", path)])
            .current_dir(&self.remote)
            .output()
            .expect("git show");
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

/// Bare repository with `main` as its default branch.
pub fn init_bare_remote(dir: &Path) -> PathBuf {
    let remote = dir.join("remote.git");
    let status = Command::new("git")
        .args(["init", "--bare", "-q"])
        .arg(&remote)
        .status()
        .expect("git init");
    assert!(status.success());
    let status = Command::new("git")
        .args(["symbolic-ref", "HEAD", "refs/heads/main"])
        .current_dir(&remote)
        .status()
        .expect("git symbolic-ref");
    assert!(status.success());
    remote
}

/// Upper bound for anything the tests wait on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
