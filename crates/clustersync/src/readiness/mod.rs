//! Readiness evaluation of per-cluster status reports.

pub mod checker;
pub mod engine;
pub mod report;

pub use checker::ReadyChecker;
pub use engine::{ReadinessEngine, ReportOutcome};
pub use report::{BundleStatus, ResourceStatusReport, STATUS_API_VERSION, STATUS_KIND};
