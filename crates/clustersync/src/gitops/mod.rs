//! Git-backed delivery: the per-repository engine, the engine pool and the
//! status watch supervisor.

pub mod error;
pub mod git;
pub mod registry;
pub mod watch;

pub use error::{classify_git_error, GitOpsError};
pub use git::{
    ChangeSet, CommitFile, CommitOutcome, FileOp, GitRemote, GitRepositoryEngine, GitSettings,
    PullOutcome,
};
pub use registry::GitEngineRegistry;
pub use watch::{GitStatusSource, StatusSource, StatusWatch, WatchKey, WatchSupervisor};
