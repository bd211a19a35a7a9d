//! Observability setup: structured logging routed per daemon config, and an
//! optional Prometheus metrics exporter.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use perch_common::config::{LogConfig, LogDestination};
use perch_common::error::ConfigError;

/// Initialize the global tracing subscriber according to the daemon's
/// logging configuration. `verbose` drops the floor to debug regardless of
/// the configured level (the `-v` switch).
///
/// Must be called once, before monitoring starts.
pub fn init_tracing(log: &LogConfig, verbose: bool) -> Result<(), ConfigError> {
    let level = if verbose {
        "debug"
    } else {
        perch_common::config::parse_log_level(&log.log_level)?
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log.log_type {
        LogDestination::Stderr => {
            let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
        LogDestination::File => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log.log_file)
                .map_err(|e| ConfigError::Parse {
                    path: log.log_file.clone(),
                    message: format!("unable to open log file: {e}"),
                })?;
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
    }
    Ok(())
}

/// Install the Prometheus metrics exporter on `listen_addr`. Called only
/// when the operator configured an address; the `metrics` macros elsewhere
/// in the daemon are no-ops without it.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected_before_subscriber_install() {
        let log = LogConfig {
            log_level: "shouty".into(),
            ..LogConfig::default()
        };
        assert!(matches!(
            init_tracing(&log, false),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_file_destination_requires_openable_path() {
        let log = LogConfig {
            log_level: "info".into(),
            log_type: LogDestination::File,
            log_file: "/nonexistent-dir/perchd.log".into(),
        };
        assert!(init_tracing(&log, false).is_err());
    }
}
