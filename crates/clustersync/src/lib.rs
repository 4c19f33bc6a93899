pub mod config;
pub mod context;
pub mod depend;
pub mod error;
pub mod gitops;
pub mod notify;
pub mod provider;
pub mod readiness;
pub mod sanitize;
pub mod secrets;
pub mod sync;
pub mod telemetry;

pub use config::{load_config, load_config_from_env, EngineConfig};
pub use context::{AppContext, ContextReference, ContextStore, MemoryContextStore};
pub use depend::{DependencyCriteria, DependencyManager, DependencyRegistry, WaitKind, WaitOutcome};
pub use error::{ConfigError, ErrorKind, Result, SyncError};
pub use gitops::{ChangeSet, GitEngineRegistry, GitOpsError, GitRepositoryEngine, WatchSupervisor};
pub use notify::{BroadcastNotifier, NoopNotifier, StatusEvent, StatusEventKind, StatusNotifier};
pub use provider::{
    select_provider, CloudConfigStore, ClusterKey, ClusterSyncProvider, GitOpsConfig, KvBundle,
    MemoryCloudConfigStore, ProviderError,
};
pub use readiness::{ReadinessEngine, ReportOutcome, ResourceStatusReport};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use sync::SyncEngine;
pub use telemetry::init_logging;
