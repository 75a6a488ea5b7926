//! Prometheus metrics for stiltctl.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `stiltctl_events_enqueued_total` - Events written to the queue
//! - `stiltctl_events_dequeued_total` - Events claimed from the queue
//! - `stiltctl_unit_outcomes_total` - Units of work by outcome
//!
//! ## Gauges
//! - `stiltctl_scene_successful_simulations` - Per-scene completed runs
//! - `stiltctl_scene_total_simulations` - Per-scene planned runs
//!
//! ## Histograms
//! - `stiltctl_stage_duration_seconds` - Stage body duration
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for stiltctl metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `event_kind`.
pub static EVENTS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("stiltctl_events_enqueued_total", "Events written to the queue");
    CounterVec::new(opts, &["event_kind"])
        .expect("stiltctl_events_enqueued_total metric creation failed")
});

/// Labels: `event_kind`.
pub static EVENTS_DEQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("stiltctl_events_dequeued_total", "Events claimed from the queue");
    CounterVec::new(opts, &["event_kind"])
        .expect("stiltctl_events_dequeued_total metric creation failed")
});

/// Labels: `stage`, `outcome` (committed, failed, empty, rolled_back).
pub static UNIT_OUTCOMES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("stiltctl_unit_outcomes_total", "Units of work by outcome");
    CounterVec::new(opts, &["stage", "outcome"])
        .expect("stiltctl_unit_outcomes_total metric creation failed")
});

/// Labels: `scene_id`.
pub static SCENE_SUCCESSFUL_SIMULATIONS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stiltctl_scene_successful_simulations",
        "Completed simulations per scene",
    );
    GaugeVec::new(opts, &["scene_id"])
        .expect("stiltctl_scene_successful_simulations metric creation failed")
});

/// Labels: `scene_id`.
pub static SCENE_TOTAL_SIMULATIONS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("stiltctl_scene_total_simulations", "Planned simulations per scene");
    GaugeVec::new(opts, &["scene_id"])
        .expect("stiltctl_scene_total_simulations metric creation failed")
});

/// Labels: `stage`, `outcome`.
pub static STAGE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "stiltctl_stage_duration_seconds",
        "Stage body duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["stage", "outcome"])
        .expect("stiltctl_stage_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EVENTS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(EVENTS_DEQUEUED_TOTAL.clone()),
        Box::new(UNIT_OUTCOMES_TOTAL.clone()),
        Box::new(SCENE_SUCCESSFUL_SIMULATIONS.clone()),
        Box::new(SCENE_TOTAL_SIMULATIONS.clone()),
        Box::new(STAGE_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_events_enqueued(event_kind: &str, count: usize) {
    EVENTS_ENQUEUED_TOTAL
        .with_label_values(&[event_kind])
        .inc_by(count as f64);
}

pub fn record_event_dequeued(event_kind: &str) {
    EVENTS_DEQUEUED_TOTAL.with_label_values(&[event_kind]).inc();
}

pub fn record_unit_outcome(stage: &str, outcome: &str) {
    UNIT_OUTCOMES_TOTAL.with_label_values(&[stage, outcome]).inc();
}

pub fn set_scene_progress(scene_id: &str, successful: u32, total: u32) {
    SCENE_SUCCESSFUL_SIMULATIONS
        .with_label_values(&[scene_id])
        .set(f64::from(successful));
    SCENE_TOTAL_SIMULATIONS
        .with_label_values(&[scene_id])
        .set(f64::from(total));
}

pub fn observe_stage_duration(stage: &str, outcome: &str, duration_secs: f64) {
    STAGE_DURATION_SECONDS
        .with_label_values(&[stage, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
