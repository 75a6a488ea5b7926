use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::queue::Store;
use crate::runtime::{Deadline, ShutdownToken};
use crate::telemetry::{instrument_stage, record_event_dequeued, record_unit_outcome, StageTimer};
use crate::unit_of_work::{Outcome, UnitOfWork};

/// When a worker stops polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Handle at most one event.
    Once,
    /// Handle events until the queue is empty.
    DrainAndExit,
    /// Keep polling, sleeping for the backoff whenever the queue is empty.
    Continuous,
}

/// Configuration for a stage worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier used in logs and spans.
    pub worker_id: String,
    pub poll_mode: PollMode,
    /// Sleep between polls of an empty queue, in milliseconds.
    pub backoff_ms: u64,
    /// Deadline for each stage body, in seconds.
    pub stage_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_mode: PollMode::Once,
            backoff_ms: 10_000,
            stage_timeout_secs: 1800,
        }
    }

    pub fn with_poll_mode(mut self, mode: PollMode) -> Self {
        self.poll_mode = mode;
        self
    }

    /// Set the backoff duration.
    pub fn with_backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_secs = timeout.as_secs();
        self
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// A pipeline stage driven by events of one kind.
#[async_trait]
pub trait StageHandler<S: Store>: Send + Sync + 'static {
    /// Stage name for logs and metrics.
    fn name(&self) -> &'static str;

    /// The event kind this stage consumes.
    fn consumes(&self) -> EventKind;

    /// Process one event inside `uow`, finishing before `deadline`.
    async fn handle(
        &self,
        uow: &mut UnitOfWork<S>,
        event: Event,
        deadline: Deadline,
    ) -> Result<()>;
}

/// Totals reported when a worker stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Events handled successfully.
    pub processed: u64,
    /// Events consumed by an expected failure.
    pub failed: u64,
}

/// Pulls events for one stage and runs each in its own unit of work.
pub struct Worker<S: Store, H: StageHandler<S>> {
    config: WorkerConfig,
    uow: UnitOfWork<S>,
    handler: Arc<H>,
    shutdown: ShutdownToken,
}

impl<S: Store, H: StageHandler<S>> Worker<S, H> {
    pub fn new(
        config: WorkerConfig,
        uow: UnitOfWork<S>,
        handler: H,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            uow,
            handler: Arc::new(handler),
            shutdown,
        }
    }

    /// Dequeue and handle a single event.
    ///
    /// Unexpected failures roll back and are returned as `Err`.
    pub async fn run_once(&mut self) -> Result<Outcome<()>> {
        let handler = Arc::clone(&self.handler);
        let kind = handler.consumes();
        let budget = self.config.stage_timeout();
        let timer = StageTimer::start(handler.name());

        let result = self
            .uow
            .run(move |uow| {
                Box::pin(async move {
                    let event = uow.events()?.dequeue(kind).await?;
                    record_event_dequeued(kind);
                    let deadline = Deadline::after(budget);
                    deadline.run(handler.handle(uow, event, deadline)).await
                })
            })
            .await;

        let label = match &result {
            Ok(Outcome::Committed(())) => "committed",
            Ok(outcome) if outcome.is_queue_empty() => "empty",
            Ok(Outcome::Failed(_)) => "failed",
            Err(_) => "rolled_back",
        };
        record_unit_outcome(self.handler.name(), label);
        timer.finish(label);
        result
    }

    /// Poll according to the configured [`PollMode`] until done or shut
    /// down.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let stage = self.handler.name();
        let worker_id = self.config.worker_id.clone();
        let mut report = WorkerReport::default();
        info!(stage, worker_id = %worker_id, mode = ?self.config.poll_mode, "worker started");

        loop {
            if self.shutdown.is_cancelled() {
                info!(stage, "shutdown requested; worker stopping");
                break;
            }

            let outcome = instrument_stage(stage, &worker_id, self.run_once()).await?;
            let empty = outcome.is_queue_empty();
            match outcome {
                Outcome::Committed(()) => report.processed += 1,
                Outcome::Failed(_) if empty => {}
                Outcome::Failed(_) => report.failed += 1,
            }

            match self.config.poll_mode {
                PollMode::Once => break,
                PollMode::DrainAndExit if empty => break,
                PollMode::Continuous if empty => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.backoff()) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
                _ => {}
            }
        }

        info!(
            stage,
            processed = report.processed,
            failed = report.failed,
            "worker finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new("w")
            .with_poll_mode(PollMode::Continuous)
            .with_backoff(250)
            .with_stage_timeout(Duration::from_secs(30));
        assert_eq!(config.poll_mode, PollMode::Continuous);
        assert_eq!(config.backoff(), Duration::from_millis(250));
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_worker_config_defaults_to_single_event() {
        let config = WorkerConfig::new("w");
        assert_eq!(config.poll_mode, PollMode::Once);
        assert_eq!(config.backoff(), Duration::from_secs(10));
    }
}
