//! Inter-app dependency ordering within one deployment.
//!
//! The registry is process-local. After a restart it is empty, so every
//! wait returns immediately and a resumed deployment proceeds instead of
//! deadlocking.

pub mod criteria;
pub mod error;
pub mod manager;
pub mod registry;

pub use criteria::{DependencyCriteria, WaitKind};
pub use error::DependError;
pub use manager::{DependencyManager, WaitOutcome};
pub use registry::DependencyRegistry;
