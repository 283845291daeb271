//! Logging initialisation and the scoped-span helper used around handler
//! invocations and warm-up.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use tracing::{Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level`. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Run `operation` inside `span` and record its outcome on that span.
///
/// ```ignore
/// let result = telemetry::with_span(
///     tracing::info_span!("queue.handle", message_id = %message.id),
///     handler.handle(message.clone()),
/// )
/// .await;
/// ```
pub async fn with_span<F, T, E>(span: Span, operation: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let result = operation.instrument(span.clone()).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    span.in_scope(|| match &result {
        Ok(_) => tracing::debug!(elapsed_ms, "operation succeeded"),
        Err(e) => tracing::warn!(elapsed_ms, error = %e, "operation failed"),
    });

    result
}
