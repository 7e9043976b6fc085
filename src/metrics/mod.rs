//! Prometheus metrics for the publish pipeline
//!
//! Tracks:
//! - Scheduler runs: outcome counts and run duration
//! - Items: terminal outcome of each publish attempt
//! - Circuit breaker transitions per endpoint
//! - Media webhook deliveries and idempotency replays
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::models::RunCounts;
use crate::resilience::CircuitState;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all pipeline metrics
struct PipelineMetrics {
    runs: CounterVec,
    run_duration: HistogramVec,
    items: CounterVec,
    circuit_transitions: CounterVec,
    circuit_state: GaugeVec,
    webhooks: CounterVec,
    idempotency_replays: CounterVec,
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first successful call registers.
///
/// ```ignore
/// if let Err(e) = castline::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if PIPELINE_METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = PipelineMetrics {
        runs: register_counter_vec!(
            "castline_scheduler_runs_total",
            "Scheduler runs by source and outcome",
            &["source", "outcome"]
        )?,
        run_duration: register_histogram_vec!(
            "castline_scheduler_run_duration_seconds",
            "Wall time of locked scheduler runs",
            &["source"],
            vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?,
        items: register_counter_vec!(
            "castline_items_total",
            "Processed items by outcome",
            &["outcome"]
        )?,
        circuit_transitions: register_counter_vec!(
            "castline_circuit_transitions_total",
            "Circuit breaker transitions by endpoint and target state",
            &["endpoint", "state"]
        )?,
        circuit_state: register_gauge_vec!(
            "castline_circuit_state",
            "Current breaker state (0 = closed, 1 = half_open, 2 = open)",
            &["endpoint"]
        )?,
        webhooks: register_counter_vec!(
            "castline_media_webhooks_total",
            "Media webhook deliveries by result",
            &["result"]
        )?,
        idempotency_replays: register_counter_vec!(
            "castline_idempotency_replays_total",
            "Requests answered from a recorded outcome",
            &["scope"]
        )?,
    };

    // A concurrent initializer may have won; its registrations stand.
    if PIPELINE_METRICS.set(metrics).is_err() {
        return Ok(());
    }

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    PIPELINE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished scheduler invocation
///
/// `outcome` is one of `success`, `failed`, `skipped`.
pub fn record_run(source: &str, outcome: &str, counts: &RunCounts, duration_secs: Option<f64>) {
    let Some(m) = PIPELINE_METRICS.get() else {
        return;
    };

    m.runs.with_label_values(&[source, outcome]).inc();
    if let Some(secs) = duration_secs {
        m.run_duration.with_label_values(&[source]).observe(secs);
    }

    for (label, value) in [
        ("published", counts.published),
        ("failed", counts.failed),
        ("retrying", counts.retrying),
        ("skipped", counts.skipped),
    ] {
        if value > 0 {
            m.items.with_label_values(&[label]).inc_by(f64::from(value));
        }
    }
}

/// Record a single item outcome outside a scheduler run (publish-now)
pub fn record_item(outcome: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.items.with_label_values(&[outcome]).inc();
    }
}

/// Record a circuit breaker transition
pub fn record_circuit_transition(endpoint: &str, state: CircuitState) {
    let Some(m) = PIPELINE_METRICS.get() else {
        return;
    };

    m.circuit_transitions
        .with_label_values(&[endpoint, state.as_str()])
        .inc();

    let gauge = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    m.circuit_state.with_label_values(&[endpoint]).set(gauge);
}

/// Record a media webhook delivery
///
/// `result` is one of `processed`, `ignored`, `unknown`, `rejected`, `error`.
pub fn record_webhook(result: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.webhooks.with_label_values(&[result]).inc();
    }
}

/// Record a request answered from the idempotency store
pub fn record_idempotency_replay(scope: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.idempotency_replays.with_label_values(&[scope]).inc();
    }
}
