// Prometheus metrics for the MediChain AI gate
//
// Exposes metrics on /metrics HTTP endpoint:
// - Gated requests by outcome (counter)
// - Backoff waits while quota is exhausted (counter)
// - Queue depth and available tokens (gauges)
// - Time from enqueue to admission (histogram)
// - Upstream AI calls and retries (counters)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Gate metrics
    pub static ref GATE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("gate_requests_total", "Gated requests by outcome"),
        &["outcome"]
    ).expect("Failed to create gate requests metric");

    pub static ref GATE_BACKOFF_WAITS_TOTAL: IntCounter = IntCounter::new(
        "gate_backoff_waits_total",
        "Number of backoff sleeps taken while quota was exhausted"
    ).expect("Failed to create backoff waits metric");

    pub static ref GATE_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "gate_queue_depth",
        "Requests waiting for admission"
    ).expect("Failed to create queue depth metric");

    pub static ref GATE_QUOTA_AVAILABLE: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("gate_quota_available", "Tokens currently available per quota"),
        &["quota"]
    ).expect("Failed to create quota available metric");

    pub static ref GATE_ADMISSION_WAIT_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("gate_admission_wait_seconds", "Time from enqueue to admission")
            .buckets(vec![0.01, 0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
    ).expect("Failed to create admission wait metric");

    // Upstream metrics
    pub static ref UPSTREAM_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("upstream_calls_total", "Upstream AI calls by result"),
        &["result"]
    ).expect("Failed to create upstream calls metric");

    pub static ref UPSTREAM_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "upstream_retries_total",
        "Retries of transient upstream failures"
    ).expect("Failed to create upstream retries metric");
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register all metrics with the global registry
///
/// Marked done only once every metric is registered, so a failed call can
/// be retried.
pub fn init() -> prometheus::Result<()> {
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }
    register_all(&REGISTRY)?;
    INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

/// Register every gate and upstream metric with `registry`
///
/// Metrics that are already registered are skipped.
pub fn register_all(registry: &Registry) -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(GATE_REQUESTS_TOTAL.clone()),
        Box::new(GATE_BACKOFF_WAITS_TOTAL.clone()),
        Box::new(GATE_QUEUE_DEPTH.clone()),
        Box::new(GATE_QUOTA_AVAILABLE.clone()),
        Box::new(GATE_ADMISSION_WAIT_SECONDS.clone()),
        Box::new(UPSTREAM_CALLS_TOTAL.clone()),
        Box::new(UPSTREAM_RETRIES_TOTAL.clone()),
    ];
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
