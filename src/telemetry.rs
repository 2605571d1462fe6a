use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless;
/// the second subscriber is simply not installed.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(json = config.json, level = %config.log_level, "branchflow telemetry initialized");
    }
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one orchestrator operation
pub fn operation_span(operation: &str, branch: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "branchflow_operation",
        operation = operation,
        branch = branch,
        session.id = tracing::field::Empty,
        correlation.id = correlation_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            json: false,
        };
        init_telemetry(&config).unwrap();
        init_telemetry(&config).unwrap();
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }
}
