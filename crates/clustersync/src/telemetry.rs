//! Logging initialisation.
//!
//! Library code logs through the `log` facade and `tracing` spans; this
//! wires both into one `tracing-subscriber` registry. `try_init` also
//! installs the `log` bridge, so `log::info!` records reach the same output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::ConfigError;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `settings.level`. Only the first call in a process
/// takes effect; later calls return `ConfigError::Logging`.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| ConfigError::Logging(format!("invalid level '{}': {}", settings.level, e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).json())
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    result.map_err(|e| ConfigError::Logging(e.to_string()))
}
