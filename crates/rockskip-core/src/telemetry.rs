use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_prometheus::PrometheusExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING: OnceLock<()> = OnceLock::new();
static TELEMETRY: OnceCell<TelemetryState> = OnceCell::new();
static METRICS: OnceCell<MetricsHandles> = OnceCell::new();

struct TelemetryState {
    _provider: SdkMeterProvider,
    registry: Registry,
}

struct MetricsHandles {
    searches: Counter<u64>,
    search_results: Counter<u64>,
    index_runs: Counter<u64>,
    indexed_commits: Counter<u64>,
    evictions: Counter<u64>,
    stage_latency_histogram: Histogram<f64>,
}

/// Initialize tracing and metrics exporters. Safe to call multiple times.
pub fn init() -> Result<()> {
    configure_logging();
    configure_metrics()?;
    Ok(())
}

fn configure_logging() {
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn configure_metrics() -> Result<&'static TelemetryState> {
    TELEMETRY.get_or_try_init(|| {
        let registry = Registry::new();
        let exporter = build_exporter(&registry)?;

        let provider = SdkMeterProvider::builder()
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                "rockskip",
            )]))
            .with_reader(exporter)
            .build();

        global::set_meter_provider(provider.clone());

        let meter = global::meter("rockskip");
        let searches = meter
            .u64_counter("rockskip_searches_total")
            .with_description("Symbol searches handled, by outcome")
            .init();
        let search_results = meter
            .u64_counter("rockskip_search_results_total")
            .with_description("Symbols returned by searches")
            .init();
        let index_runs = meter
            .u64_counter("rockskip_index_runs_total")
            .with_description("Indexing runs completed, by outcome")
            .init();
        let indexed_commits = meter
            .u64_counter("rockskip_indexed_commits_total")
            .with_description("Commits written to the ancestry table")
            .init();
        let evictions = meter
            .u64_counter("rockskip_evictions_total")
            .with_description("Repositories deleted to stay within the residency budget")
            .init();
        let stage_latency_histogram = meter
            .f64_histogram("rockskip_stage_latency_ms")
            .with_description("Latency of individual request stages in milliseconds")
            .init();

        METRICS
            .set(MetricsHandles {
                searches,
                search_results,
                index_runs,
                indexed_commits,
                evictions,
                stage_latency_histogram,
            })
            .map_err(|_| anyhow!("metrics handles already initialized"))?;

        Ok(TelemetryState {
            _provider: provider,
            registry,
        })
    })
}

fn build_exporter(registry: &Registry) -> Result<PrometheusExporter> {
    opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context("failed to build Prometheus exporter")
}

fn metrics() -> Option<&'static MetricsHandles> {
    METRICS.get()
}

fn state() -> Option<&'static TelemetryState> {
    TELEMETRY.get()
}

/// Record a finished search and the number of symbols it returned.
pub fn record_search(outcome: &'static str, results: usize) {
    if let Some(metrics) = metrics() {
        metrics
            .searches
            .add(1, &[KeyValue::new("outcome", outcome)]);
        if results > 0 {
            metrics.search_results.add(results as u64, &[]);
        }
    }
}

/// Record a finished indexing run.
pub fn record_index_run(outcome: &'static str, commits: usize) {
    if let Some(metrics) = metrics() {
        metrics
            .index_runs
            .add(1, &[KeyValue::new("outcome", outcome)]);
        if commits > 0 {
            metrics.indexed_commits.add(commits as u64, &[]);
        }
    }
}

/// Record one evicted repository.
pub fn record_eviction() {
    if let Some(metrics) = metrics() {
        metrics.evictions.add(1, &[]);
    }
}

/// Record the latency for a named stage in milliseconds.
pub fn record_stage_latency(stage: &'static str, latency_ms: u64) {
    if latency_ms == 0 {
        return;
    }
    if let Some(metrics) = metrics() {
        metrics
            .stage_latency_histogram
            .record(latency_ms as f64, &[KeyValue::new("stage", stage)]);
    }
}

/// Render all currently collected metrics in Prometheus text format.
pub fn export_prometheus() -> Result<String> {
    let state = state().ok_or_else(|| anyhow!("telemetry not initialized"))?;
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics buffer is not valid UTF-8")
}
