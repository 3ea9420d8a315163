//! Logging bootstrap.
//!
//! Installs a `tracing-subscriber` registry configured from [`LoggingConfig`].
//! The `RUST_LOG` environment variable, when set, overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let console_text = (config.log_to_console && !config.json_format)
        .then(|| fmt::layer().with_target(true));
    let console_json = (config.log_to_console && config.json_format)
        .then(|| fmt::layer().json().with_target(true));

    let file_layer = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to install subscriber for {}: {e}",
                config.app_name
            ))
        })
}
