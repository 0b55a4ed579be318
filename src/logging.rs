// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging for the console core:
// - pretty / compact / json output on stderr (stdout carries command output)
// - EnvFilter driven filtering (RUST_LOG wins over the configured level)
// - Macros for the two recurring structured events
// ============================================================================

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ConsoleError, ConsoleResult};

// ----------------------------------------------------------------------------
// 1. Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ConsoleResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_current_span(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr).with_ansi(config.colors).with_target(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| ConsoleError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "cerebro::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 2. Logging Macros
// ----------------------------------------------------------------------------

/// Log a newly surfaced alert
#[macro_export]
macro_rules! log_alert {
    ($severity:expr, $message:expr) => {
        tracing::warn!(
            target: "cerebro::alerts",
            severity = %$severity,
            message = %$message,
            "Alert raised"
        )
    };
    ($severity:expr, $message:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "cerebro::alerts",
            severity = %$severity,
            message = %$message,
            $($field)*,
            "Alert raised"
        )
    };
}

/// Log a frame or record dropped by the normalizer
#[macro_export]
macro_rules! log_frame_dropped {
    ($error:expr) => {
        tracing::warn!(
            target: "cerebro::normalizer",
            reason = $error.reason(),
            error = %$error,
            "Dropped malformed frame"
        )
    };
    ($error:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "cerebro::normalizer",
            reason = $error.reason(),
            error = %$error,
            $($field)*,
            "Dropped malformed frame"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_macros_expand_without_subscriber() {
        let err = crate::error::NormalizeError::MissingType;
        crate::log_frame_dropped!(err);
        crate::log_frame_dropped!(err, bytes = 12usize);
        crate::log_alert!(crate::types::Severity::High, "cpu above threshold");
        crate::log_alert!(crate::types::Severity::High, "cpu above threshold", alert_id = "A1");
    }
}
