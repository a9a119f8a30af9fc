use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Builds the filter from the configured level; `RUST_LOG` wins when set.
fn build_filter(level: &str) -> Result<EnvFilter> {
    let configured =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or(configured))
}

/// Initialize logging from the `logging` section of the configuration
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    }
    .wrap_err("Failed to install the tracing subscriber")?;

    tracing::info!(
        "Gantry logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        proxy = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span around one backend call
pub fn create_backend_span(destination: &str, method: &str, attempt: usize) -> tracing::Span {
    tracing::debug_span!(
        "backend_request",
        backend.url = destination,
        http.method = method,
        attempt,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        assert!(build_filter("gantry=loud").is_err());
        assert!(build_filter("info,gantry=debug").is_ok());
    }

    #[test]
    fn test_spans_accept_late_fields() {
        let span = create_request_span("GET", "/api/test", "req-123");
        span.record("proxy", "api");
        span.record("http.status_code", 200_u16);

        let span = create_backend_span("http://backend:8080/data", "POST", 2);
        span.record("http.status_code", 502_u16);
    }
}
