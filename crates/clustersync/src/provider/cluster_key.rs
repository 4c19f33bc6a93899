use std::fmt;
use std::str::FromStr;

use super::error::{ProviderError, Result};

/// A `provider+cluster` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub provider: String,
    pub cluster: String,
}

impl ClusterKey {
    pub fn new(provider: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            cluster: cluster.into(),
        }
    }

    /// Parses `provider+cluster`. Both halves must be non-empty and there
    /// must be exactly one `+`.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('+');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(cluster), None)
                if !provider.is_empty() && !cluster.is_empty() =>
            {
                Ok(Self::new(provider, cluster))
            }
            _ => Err(ProviderError::InvalidClusterKey(key.to_string())),
        }
    }
}

impl FromStr for ClusterKey {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.provider, self.cluster)
    }
}
