use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
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
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "aula_cache_response_hit_total",
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            "aula_cache_response_miss_total",
            Unit::Count,
            "Total number of response-cache misses."
        );
        describe_counter!(
            "aula_cache_response_evict_total",
            Unit::Count,
            "Total number of response-cache evictions due to capacity."
        );
        describe_counter!(
            "aula_cache_response_purged_total",
            Unit::Count,
            "Total number of response entries removed by tag purges."
        );
        describe_counter!(
            "aula_cache_inflight_wait_total",
            Unit::Count,
            "Total number of callers that waited on an in-flight computation."
        );
        describe_counter!(
            "aula_gateway_purge_requests_total",
            Unit::Count,
            "Total number of authenticated purge requests processed."
        );
        describe_counter!(
            "aula_gateway_tags_purged_total",
            Unit::Count,
            "Total number of cache entries invalidated via the gateway."
        );
        describe_counter!(
            "aula_gateway_tags_failed_total",
            Unit::Count,
            "Total number of per-tag purge failures reported to callers."
        );
        describe_counter!(
            "aula_gateway_unconfigured_total",
            Unit::Count,
            "Total number of purge requests rejected because no secret is configured."
        );
        describe_counter!(
            "aula_live_events_applied_total",
            Unit::Count,
            "Total number of change events applied to table caches."
        );
        describe_counter!(
            "aula_live_events_stale_total",
            Unit::Count,
            "Total number of change events dropped as stale by commit order."
        );
        describe_counter!(
            "aula_live_events_unkeyed_total",
            Unit::Count,
            "Total number of change events rejected for missing a row key."
        );
        describe_counter!(
            "aula_live_rollbacks_total",
            Unit::Count,
            "Total number of optimistic mutations rolled back after commit failure."
        );
    });
}
