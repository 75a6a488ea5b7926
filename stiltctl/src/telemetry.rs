//! Tracing and telemetry instrumentation for stiltctl.
//!
//! Span constructors and `record_*` helpers used by the worker loop and the
//! stage services. Every helper logs through `tracing`; with the `metrics`
//! feature it also updates the Prometheus collectors in
//! [`crate::metrics`].

use std::future::Future;
use std::time::Instant;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::domain::SceneId;
use crate::events::EventKind;

/// Install the global fmt subscriber.
///
/// `level` is an `EnvFilter` directive. Without one, or when it does not
/// parse, `RUST_LOG` applies, then `info`.
pub fn init_tracing(level: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(log_filter(level))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = crate::metrics::init_metrics() {
            tracing::warn!(error = %err, "failed to register metrics");
        }
    }
}

fn log_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Span covering one unit of work in a stage.
#[must_use]
pub fn stage_span(stage: &str, worker_id: &str) -> Span {
    info_span!("stiltctl.stage", stage = %stage, worker_id = %worker_id)
}

/// Span covering one simulation run.
#[must_use]
pub fn simulation_span(scene_id: &SceneId, simulation_id: &str) -> Span {
    info_span!(
        "stiltctl.simulation",
        scene_id = %scene_id,
        simulation_id = %simulation_id,
    )
}

/// Attach a [`stage_span`] to `future`.
pub fn instrument_stage<F>(
    stage: &str,
    worker_id: &str,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(stage_span(stage, worker_id))
}

pub fn record_events_enqueued(kind: EventKind, count: usize) {
    tracing::debug!(event_kind = %kind, count, "events enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_events_enqueued(kind.as_str(), count);
}

pub fn record_event_dequeued(kind: EventKind) {
    tracing::debug!(event_kind = %kind, "event dequeued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_dequeued(kind.as_str());
}

/// Record how a unit of work ended: `committed`, `failed`, `empty` or
/// `rolled_back`.
pub fn record_unit_outcome(stage: &str, outcome: &str) {
    tracing::debug!(stage = %stage, outcome = %outcome, "unit of work closed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_unit_outcome(stage, outcome);
}

/// Record scene progress after a successful simulation.
pub fn record_scene_progress(scene_id: &SceneId, successful: u32, total: u32) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_scene_progress(scene_id.as_str(), successful, total);

    #[cfg(not(feature = "metrics"))]
    let _ = (scene_id, successful, total);
}

/// Times a stage body and records its duration when dropped or finished.
#[derive(Debug)]
pub struct StageTimer {
    stage: String,
    started: Instant,
    finished: bool,
}

impl StageTimer {
    pub fn start(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Record the duration under `outcome`.
    pub fn finish(mut self, outcome: &str) {
        self.observe(outcome);
        self.finished = true;
    }

    fn observe(&self, outcome: &str) {
        let secs = self.started.elapsed().as_secs_f64();
        tracing::debug!(stage = %self.stage, outcome = %outcome, secs, "stage timing");

        #[cfg(feature = "metrics")]
        crate::metrics::observe_stage_duration(&self.stage, outcome, secs);
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.observe("abandoned");
        }
    }
}
