// Structured Logging for Signal Hunt
// tracing-based setup, initialized once per process

use tracing::Level;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

static INIT: Once = Once::new();

/// Setup structured logging for the entire application
pub fn setup_logging(log_level: Option<&str>, json_format: Option<bool>) {
    let log_level_str = log_level.unwrap_or("INFO");
    let json_format = json_format.unwrap_or(false);

    let level = match log_level_str.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    };

    INIT.call_once(|| {
        // Suppress noisy transport libraries
        let filter = EnvFilter::from_default_env()
            .add_directive(level.into())
            .add_directive("tokio_tungstenite=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
            .add_directive("teloxide=warn".parse().unwrap());

        if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .init();
        }

        tracing::info!(log_level = %log_level_str, "Logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_idempotent() {
        setup_logging(Some("DEBUG"), Some(false));
        // Second call is a no-op
        setup_logging(Some("INFO"), Some(true));
    }
}
