//! Process-wide pool of repository engines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::git::{GitRemote, GitRepositoryEngine, GitSettings};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EngineKey {
    user: String,
    repo: String,
    path: PathBuf,
}

/// Hands out one [`GitRepositoryEngine`] per local clone.
///
/// Every provider that talks to the same repository shares the same engine,
/// so all writes to one clone are serialized. Clones live under
/// `<work_dir>/<user>-<repo>`.
pub struct GitEngineRegistry {
    work_dir: PathBuf,
    settings: GitSettings,
    engines: Mutex<HashMap<EngineKey, Arc<GitRepositoryEngine>>>,
}

impl GitEngineRegistry {
    pub fn new(work_dir: impl Into<PathBuf>, settings: GitSettings) -> Self {
        Self {
            work_dir: work_dir.into(),
            settings,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Local clone location for a remote.
    pub fn clone_path(&self, remote: &GitRemote) -> PathBuf {
        self.work_dir
            .join(format!("{}-{}", remote.user, remote.repo))
    }

    /// Returns the engine for `remote`, creating it on first use.
    ///
    /// The first caller's credentials stick for the life of the engine.
    pub fn engine_for(&self, remote: &GitRemote) -> Arc<GitRepositoryEngine> {
        let path = self.clone_path(remote);
        let key = EngineKey {
            user: remote.user.clone(),
            repo: remote.repo.clone(),
            path: path.clone(),
        };

        let mut engines = self.lock();
        Arc::clone(engines.entry(key).or_insert_with(|| {
            log::debug!("New git engine for {}/{} at {}", remote.user, remote.repo, path.display());
            Arc::new(GitRepositoryEngine::new(
                remote.clone(),
                path,
                self.settings.clone(),
            ))
        }))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EngineKey, Arc<GitRepositoryEngine>>> {
        match self.engines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Git engine registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
