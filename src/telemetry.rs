//! Tracing initialization.
//!
//! The scout is a library; it never installs a global subscriber on its own.
//! Applications (and the integration tests) call [`init`] once.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::{LogFormat, LoggingConfig};

/// Install a global subscriber per the logging configuration. Safe to call
/// more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    if !config.stdout {
        return;
    }
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) => EnvFilter::new(env),
        Err(_) => EnvFilter::new(config.filter.as_deref().unwrap_or("info")),
    };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match config.stdout_format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        init(&config);
        init(&config);
    }
}
