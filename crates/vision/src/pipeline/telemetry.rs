//! Telemetry helpers for tracing spans, Prometheus metrics and thread spawning.

use std::{io, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::pipeline::config::TelemetryOptions;

static PROM_INSTALLED: OnceLock<()> = OnceLock::new();

pub(crate) const CAPTURES_TOTAL: &str = "snapcam_captures_total";
pub(crate) const STAGE_LATENCY: &str = "snapcam_stage_latency_seconds";
pub(crate) const DISCARDED_COMPLETIONS: &str = "snapcam_discarded_completions_total";

/// Install the global tracing subscriber and, when requested, the Prometheus
/// exporter.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init(opts: &TelemetryOptions) -> Result<()> {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if installed.is_err() {
        debug!("tracing subscriber already installed");
    }

    if let Some(addr) = opts.metrics_addr {
        if PROM_INSTALLED.get().is_none() {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .with_context(|| format!("failed to start Prometheus exporter on {addr}"))?;
            let _ = PROM_INSTALLED.set(());
            tracing::info!(%addr, "prometheus exporter listening");
        }
    }
    Ok(())
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

pub(crate) fn record_capture(outcome: &'static str) {
    metrics::counter!(CAPTURES_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn record_stage(stage: &'static str, elapsed: Duration) {
    metrics::histogram!(STAGE_LATENCY, "stage" => stage).record(elapsed.as_secs_f64());
}

pub(crate) fn record_discarded() {
    metrics::counter!(DISCARDED_COMPLETIONS).increment(1);
}
