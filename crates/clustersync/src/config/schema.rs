use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gitops::GitSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Poll period of git-backed status watches.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
    /// Local clones live under `<workDir>/<user>-<repo>`.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Server-side apply field manager for direct cluster writes.
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
    #[serde(default = "default_deployment_label")]
    pub deployment_label: String,
    /// Label the cluster monitor uses to tie a status CR to `<cid>-<app>`.
    #[serde(default = "default_instance_label")]
    pub instance_label: String,
    #[serde(default = "default_git_user_email_domain")]
    pub git_user_email_domain: String,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub conflict_retry: RetryConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_watch_interval_secs() -> u64 {
    60
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_field_manager() -> String {
    "rsync".to_string()
}

fn default_deployment_label() -> String {
    "emco/deployment-id".to_string()
}

fn default_instance_label() -> String {
    "k8splugin.io/rb-instance-id".to_string()
}

fn default_git_user_email_domain() -> String {
    "gmail.com".to_string()
}

fn default_git_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watch_interval_secs: default_watch_interval_secs(),
            work_dir: default_work_dir(),
            field_manager: default_field_manager(),
            deployment_label: default_deployment_label(),
            instance_label: default_instance_label(),
            git_user_email_domain: default_git_user_email_domain(),
            git_timeout_secs: default_git_timeout_secs(),
            conflict_retry: RetryConfig::default(),
            azure: AzureConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn git_settings(&self) -> GitSettings {
        GitSettings {
            user_email_domain: self.git_user_email_domain.clone(),
            timeout_secs: self.git_timeout_secs,
        }
    }
}

/// Bounded retry policy for optimistic-concurrency conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_retry_steps")]
    pub steps: u32,
    #[serde(default = "default_retry_interval_millis")]
    pub interval_millis: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_retry_steps() -> u32 {
    5
}

fn default_retry_interval_millis() -> u64 {
    10
}

fn default_retry_factor() -> f64 {
    1.0
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            steps: default_retry_steps(),
            interval_millis: default_retry_interval_millis(),
            factor: default_retry_factor(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.max(1.0).powi(attempt as i32);
        Duration::from_secs_f64(self.interval_millis as f64 * scale / 1000.0)
    }

    /// Delay before retry number `attempt`, stretched by up to `jitter`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread: f64 = rand::random::<f64>() * self.jitter;
        base.mul_f64(1.0 + spread)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_management_url")]
    pub management_url: String,
}

fn default_login_url() -> String {
    "https://login.microsoftonline.com/".to_string()
}

fn default_management_url() -> String {
    "https://management.azure.com/".to_string()
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            management_url: default_management_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}
