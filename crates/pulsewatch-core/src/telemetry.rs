//! Logging and metrics setup

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LoggingConfig, MetricsConfig};
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes the
/// file writer and must live as long as the process logs.
pub fn init_tracing(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sqlx=warn,hyper=info,reqwest=info")));

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "pulsewatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| Error::config(format!("failed to install tracing subscriber: {e}")))?;

    Ok(guard)
}

/// Start the Prometheus scrape endpoint when enabled
pub fn install_metrics_exporter(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen.parse().map_err(|e| {
        Error::config(format!("invalid metrics listen address '{}': {e}", config.listen))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::internal(format!("failed to install metrics exporter: {e}")))?;

    describe_metrics();
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("pulsewatch_checks_total", "Health checks executed, by status");
    metrics::describe_histogram!(
        "pulsewatch_check_response_ms",
        metrics::Unit::Milliseconds,
        "Health check response time"
    );
    metrics::describe_counter!("pulsewatch_scheduled_total", "Check messages enqueued, by priority");
    metrics::describe_counter!(
        "pulsewatch_schedule_errors_total",
        "Monitors that could not be scheduled"
    );
    metrics::describe_counter!(
        "pulsewatch_messages_total",
        "Queue messages handled, by queue and outcome"
    );
    metrics::describe_counter!("pulsewatch_alerts_total", "Alert rule evaluations, by outcome");
}
