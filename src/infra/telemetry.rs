use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::SwrError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Fails if another global subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), SwrError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| SwrError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every metric the engine emits.
///
/// Safe to call repeatedly; only the first call reaches the recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "swr_fetch_total",
            Unit::Count,
            "Total number of producer invocations."
        );
        describe_counter!(
            "swr_dedup_hit_total",
            Unit::Count,
            "Total number of subscriptions served without a producer call."
        );
        describe_counter!(
            "swr_retry_scheduled_total",
            Unit::Count,
            "Total number of retries scheduled after a failed fetch."
        );
        describe_counter!(
            "swr_refresh_scheduled_total",
            Unit::Count,
            "Total number of periodic refreshes scheduled after a successful fetch."
        );
        describe_counter!(
            "swr_producer_error_total",
            Unit::Count,
            "Total number of error events emitted by producers."
        );
        describe_counter!(
            "swr_mutate_total",
            Unit::Count,
            "Total number of out-of-band mutations applied."
        );
        describe_counter!(
            "swr_cache_expired_total",
            Unit::Count,
            "Total number of cache entries removed by their expiry timer."
        );
        describe_gauge!(
            "swr_subscribers",
            Unit::Count,
            "Current number of attached subscriptions across all keys."
        );
    });
}
