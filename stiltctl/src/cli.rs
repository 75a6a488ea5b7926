//! Command-line surface and composition root.
//!
//! [`Pipeline`] runs one subcommand against any [`Store`]; [`execute`] wires
//! it to Postgres, local buckets and the STILT executables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{DeadlinePolicy, SettingsArgs, StageTimeouts};
use crate::domain::{load_domain_configs, DomainConfig};
use crate::error::Result;
use crate::meteorology::MeteorologyCropper;
use crate::queue::Store;
use crate::runtime::{Deadline, PollMode, ShutdownToken, StageHandler, Worker, WorkerConfig, WorkerReport};
use crate::services::{
    generate_scene, ExecuteSimulationStage, GenerateSimulationsStage, MinimizeMeteorologyStage,
};
use crate::simulation::SimulationEngine;
use crate::storage::BucketProvider;
use crate::unit_of_work::{Outcome, UnitOfWork};

#[derive(Parser, Debug)]
#[command(name = "stiltctl", version, about = "Coordinate STILT simulation pipelines")]
pub struct Cli {
    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Register a scene for every domain config document under PATH.
    GenerateScenes {
        path: PathBuf,
        /// Deadline for each scene, in seconds.
        #[arg(long)]
        stage_timeout_secs: Option<u64>,
    },
    /// Crop meteorology for one created scene.
    MinimizeMeteorology {
        #[arg(long)]
        stage_timeout_secs: Option<u64>,
    },
    /// Fan one minimized scene out into simulations.
    GenerateSimulations {
        #[arg(long)]
        stage_timeout_secs: Option<u64>,
    },
    /// Run queued simulations until interrupted.
    ExecuteSimulations {
        /// Stop once the queue is empty instead of polling.
        #[arg(long)]
        exit_on_empty: bool,
        /// Seconds to wait before polling an empty queue again.
        #[arg(long, default_value_t = 10)]
        backoff_secs: u64,
        #[arg(long)]
        stage_timeout_secs: Option<u64>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GenerateScenes { .. } => "generate-scenes",
            Self::MinimizeMeteorology { .. } => "minimize-meteorology",
            Self::GenerateSimulations { .. } => "generate-simulations",
            Self::ExecuteSimulations { .. } => "execute-simulations",
        }
    }

    fn stage_timeout(&self, defaults: &StageTimeouts) -> Duration {
        let (override_secs, default) = match self {
            Self::GenerateScenes { stage_timeout_secs, .. } => {
                (stage_timeout_secs, defaults.generate_scenes)
            }
            Self::MinimizeMeteorology { stage_timeout_secs } => {
                (stage_timeout_secs, defaults.minimize_meteorology)
            }
            Self::GenerateSimulations { stage_timeout_secs } => {
                (stage_timeout_secs, defaults.generate_simulations)
            }
            Self::ExecuteSimulations { stage_timeout_secs, .. } => {
                (stage_timeout_secs, defaults.execute_simulations)
            }
        };
        override_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// Everything a subcommand needs, independent of the backing store.
#[derive(Clone)]
pub struct Pipeline<S: Store> {
    pub store: Arc<S>,
    pub buckets: Arc<dyn BucketProvider>,
    pub artifact_bucket: String,
    pub deadline_policy: DeadlinePolicy,
    pub stage_timeouts: StageTimeouts,
    pub cropper: Arc<dyn MeteorologyCropper>,
    pub engine: Arc<dyn SimulationEngine>,
    pub work_dir: PathBuf,
    pub shutdown: ShutdownToken,
}

impl<S: Store> Pipeline<S> {
    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::new(
            Arc::clone(&self.store),
            self.buckets.bucket(&self.artifact_bucket),
            self.deadline_policy,
        )
    }

    /// Run `command` to completion.
    ///
    /// Expected failures are logged and counted in the report; only
    /// unexpected ones are returned as `Err`.
    pub async fn run(&self, command: &Commands) -> Result<WorkerReport> {
        let stage_timeout = command.stage_timeout(&self.stage_timeouts);
        match command {
            Commands::GenerateScenes { path, .. } => {
                let configs = load_domain_configs(path)?;
                self.generate_scenes(configs, stage_timeout).await
            }
            Commands::MinimizeMeteorology { .. } => {
                let stage = MinimizeMeteorologyStage::new(
                    Arc::clone(&self.buckets),
                    Arc::clone(&self.cropper),
                    self.work_dir.clone(),
                );
                self.run_worker(stage, PollMode::Once, stage_timeout, 0).await
            }
            Commands::GenerateSimulations { .. } => {
                self.run_worker(GenerateSimulationsStage, PollMode::Once, stage_timeout, 0)
                    .await
            }
            Commands::ExecuteSimulations {
                exit_on_empty,
                backoff_secs,
                ..
            } => {
                let mode = if *exit_on_empty {
                    PollMode::DrainAndExit
                } else {
                    PollMode::Continuous
                };
                let stage =
                    ExecuteSimulationStage::new(Arc::clone(&self.engine), self.work_dir.clone());
                self.run_worker(stage, mode, stage_timeout, backoff_secs.saturating_mul(1000))
                    .await
            }
        }
    }

    /// One unit of work per config; duplicates are reported and skipped.
    pub async fn generate_scenes(
        &self,
        configs: Vec<DomainConfig>,
        stage_timeout: Duration,
    ) -> Result<WorkerReport> {
        let mut uow = self.unit_of_work();
        let mut report = WorkerReport::default();
        for config in configs {
            if self.shutdown.is_cancelled() {
                warn!("shutdown requested; remaining configs skipped");
                break;
            }
            let outcome = uow
                .run(move |uow| {
                    Box::pin(async move {
                        let deadline = Deadline::after(stage_timeout);
                        deadline.run(generate_scene(uow, &config)).await
                    })
                })
                .await?;
            match outcome {
                Outcome::Committed(_) => report.processed += 1,
                Outcome::Failed(_) => report.failed += 1,
            }
        }
        info!(
            created = report.processed,
            skipped = report.failed,
            "scene generation finished"
        );
        Ok(report)
    }

    async fn run_worker<H: StageHandler<S>>(
        &self,
        handler: H,
        mode: PollMode,
        stage_timeout: Duration,
        backoff_ms: u64,
    ) -> Result<WorkerReport> {
        let config = WorkerConfig::new(format!("{}-{}", handler.name(), std::process::id()))
            .with_poll_mode(mode)
            .with_backoff(backoff_ms)
            .with_stage_timeout(stage_timeout);
        Worker::new(config, self.unit_of_work(), handler, self.shutdown.clone())
            .run()
            .await
    }
}

/// Build the production pipeline from `cli` and run its command.
#[cfg(feature = "postgres")]
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    use crate::config::StiltctlConfig;
    use crate::meteorology::XtrctCropper;
    use crate::persistence::{PgStore, Schema};
    use crate::simulation::StiltCli;
    use crate::storage::LocalBuckets;

    let config = StiltctlConfig::try_from(cli.settings)?;
    let store = PgStore::connect(&config.persistence, Schema::default()).await?;
    store.healthcheck().await?;
    store.migrate().await?;

    let shutdown = ShutdownToken::new();
    shutdown.cancel_on_signals();

    let pipeline = Pipeline {
        store: Arc::new(store),
        buckets: Arc::new(LocalBuckets::new(&config.artifact_root)),
        artifact_bucket: config.artifact_bucket.clone(),
        deadline_policy: config.deadline_policy,
        stage_timeouts: config.stage_timeouts,
        cropper: Arc::new(XtrctCropper::from_stilt_path(
            &config.stilt_path,
            config.work_dir.join("xtrct"),
        )),
        engine: Arc::new(StiltCli::new(&config.stilt_path)),
        work_dir: config.work_dir.clone(),
        shutdown,
    };

    let report = pipeline.run(&cli.command).await?;
    info!(
        command = cli.command.name(),
        processed = report.processed,
        failed = report.failed,
        "command finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["stiltctl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_execute_simulations() {
        let cli = parse(&["execute-simulations", "--exit-on-empty"]);
        assert_eq!(
            cli.command,
            Commands::ExecuteSimulations {
                exit_on_empty: true,
                backoff_secs: 10,
                stage_timeout_secs: None,
            }
        );
    }

    #[test]
    fn test_global_settings_follow_subcommand() {
        let cli = parse(&["generate-scenes", "configs/", "--deadline-policy", "drop"]);
        assert_eq!(cli.settings.deadline_policy, Some(DeadlinePolicy::Drop));
        assert_eq!(cli.command.name(), "generate-scenes");
    }

    #[test]
    fn test_stage_timeouts_default_per_command() {
        let defaults = StageTimeouts::default();
        let scenes = parse(&["generate-scenes", "x"]).command;
        assert_eq!(scenes.stage_timeout(&defaults), Duration::from_secs(30));

        let execute = parse(&["execute-simulations", "--stage-timeout-secs", "5"]).command;
        assert_eq!(execute.stage_timeout(&defaults), Duration::from_secs(5));
    }
}
