/*!
 * Structured Tracing
 * Subscriber setup and per-operation spans using the tracing crate
 */

use crate::core::limits::ENV_TRACE_JSON;
use crate::core::PoolId;
use std::time::Instant;
use tracing::{debug, info, span, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// Environment variables:
/// - RUST_LOG: log level (default: info)
/// - PMHEAP_TRACE_JSON: JSON output when "1" or "true"
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(ENV_TRACE_JSON)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

/// Span covering one heap operation, recording its duration on drop
pub struct OperationSpan {
    span: Span,
    start: Instant,
    op: &'static str,
}

impl OperationSpan {
    pub fn new(op: &'static str, pool: PoolId) -> Self {
        let span = span!(
            Level::DEBUG,
            "heap_op",
            op,
            pool,
            duration_us = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            op,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let duration_us = self.start.elapsed().as_micros() as u64;
        self.span.record("duration_us", duration_us);
        let _entered = self.span.enter();
        debug!(op = self.op, duration_us, "heap operation finished");
    }
}
