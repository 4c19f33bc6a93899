use std::path::Path;

use crate::config::schema::EngineConfig;
use crate::error::ConfigError;

/// Environment variable naming the config file for [`load_config_from_env`].
pub const CONFIG_ENV_VAR: &str = "CLUSTERSYNC_CONFIG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Parses a YAML (or JSON) document. An empty document yields the defaults.
pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = if content.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file named by `CLUSTERSYNC_CONFIG`, or the defaults when unset.
pub fn load_config_from_env() -> Result<EngineConfig, ConfigError> {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => {
            log::info!("Loading engine config from {}", path);
            load_config(path)
        }
        _ => Ok(EngineConfig::default()),
    }
}

fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.watch_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "watchIntervalSecs must be greater than zero".to_string(),
        });
    }

    if config.git_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "gitTimeoutSecs must be greater than zero".to_string(),
        });
    }

    if config.conflict_retry.steps == 0 {
        return Err(ConfigError::Validation {
            message: "conflictRetry.steps must be greater than zero".to_string(),
        });
    }

    if config.conflict_retry.jitter < 0.0 || config.conflict_retry.factor < 0.0 {
        return Err(ConfigError::Validation {
            message: "conflictRetry.factor and conflictRetry.jitter must not be negative"
                .to_string(),
        });
    }

    for (field, value) in [
        ("azure.loginUrl", &config.azure.login_url),
        ("azure.managementUrl", &config.azure.management_url),
    ] {
        validate_http_url(field, value)?;
    }

    if config.field_manager.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "fieldManager must not be empty".to_string(),
        });
    }

    Ok(())
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
        Ok(url) => Err(ConfigError::Validation {
            message: format!("{} must use http or https, got '{}'", field, url.scheme()),
        }),
        Err(e) => Err(ConfigError::Validation {
            message: format!("{} is not an absolute URL: {}", field, e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_yaml_config() {
        let config = load_config_from_str(
            r#"
watchIntervalSecs: 5
workDir: /var/lib/rsync
fieldManager: clustersync
conflictRetry:
  steps: 3
logging:
  level: debug
  format: json
"#,
        )
        .unwrap();

        assert_eq!(config.watch_interval_secs, 5);
        assert_eq!(config.work_dir, std::path::PathBuf::from("/var/lib/rsync"));
        assert_eq!(config.field_manager, "clustersync");
        assert_eq!(config.conflict_retry.steps, 3);
        assert_eq!(config.conflict_retry.interval_millis, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.deployment_label, "emco/deployment-id");
    }

    #[test]
    fn test_load_json_config() {
        let config = load_config_from_str(r#"{"gitTimeoutSecs": 30}"#).unwrap();
        assert_eq!(config.git_timeout_secs, 30);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = load_config_from_str("watchIntervalSecs: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_bad_azure_url_rejected() {
        let err = load_config_from_str("azure:\n  loginUrl: not-a-url\n").unwrap_err();
        assert!(err.to_string().contains("azure.loginUrl"));

        let err = load_config_from_str("azure:\n  managementUrl: ftp://x/\n").unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = load_config_from_str("watchIntervalSecs: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/clustersync.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "watchIntervalSecs: 7").unwrap();

        std::env::set_var(CONFIG_ENV_VAR, file.path());
        let config = load_config_from_env().unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.watch_interval_secs, 7);
    }

    #[test]
    #[serial]
    fn test_load_from_env_unset() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let config = load_config_from_env().unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
