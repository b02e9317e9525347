use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info` (and `warn` for the
/// HTTP and Redis client crates).
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn,redis=warn"));

    let fmt_layer = match log_format {
        LogFormat::Pretty => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })
}

/// Install the Prometheus recorder used by the `metrics` macros
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install Prometheus exporter: {e}"),
            })
        })?;
    metrics::describe_counter!(
        "autopost_quota_decisions_total",
        "Quota decisions by outcome (allowed, denied, unmetered, degraded, unavailable)"
    );
    metrics::describe_counter!(
        "autopost_quota_store_errors_total",
        "Failed or timed-out quota store operations by backend"
    );
    Ok(handle)
}
