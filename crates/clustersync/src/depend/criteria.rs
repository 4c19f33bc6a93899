//! Dependency criteria between apps of one deployment.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state a prerequisite app must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitKind {
    /// The prerequisite's resources were accepted by every target cluster.
    Deployed,
    /// The prerequisite's resources are healthy on every target cluster.
    Ready,
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKind::Deployed => f.write_str("Deployed"),
            WaitKind::Ready => f.write_str("Ready"),
        }
    }
}

/// "Wait for `target_app` to reach `wait_kind`, then `settle_delay_secs` more."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCriteria {
    #[serde(rename = "app")]
    pub target_app: String,
    #[serde(rename = "opStatus")]
    pub wait_kind: WaitKind,
    #[serde(rename = "wait", default)]
    pub settle_delay_secs: u64,
}

impl DependencyCriteria {
    pub fn new(target_app: impl Into<String>, wait_kind: WaitKind) -> Self {
        Self {
            target_app: target_app.into(),
            wait_kind,
            settle_delay_secs: 0,
        }
    }

    pub fn with_settle_delay(mut self, secs: u64) -> Self {
        self.settle_delay_secs = secs;
        self
    }
}
