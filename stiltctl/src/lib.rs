//! stiltctl - coordinator for STILT footprint simulation pipelines.
//!
//! A scene is a grid of receptors to simulate against one meteorology
//! source. stiltctl breaks a scene into stages connected by a transactional
//! event queue, so any number of workers can pick up the next piece of work:
//!
//! 1. `generate-scenes` registers each domain config and emits
//!    `scene_created`.
//! 2. `minimize-meteorology` crops the archived meteorology to the scene and
//!    emits `meteorology_minimized`.
//! 3. `generate-simulations` fans the scene out into one
//!    `simulation_created` event per receptor.
//! 4. `execute-simulations` runs STILT for each receptor and counts it
//!    against the scene.
//!
//! Every stage runs inside a [`UnitOfWork`]: success commits, expected
//! domain failures commit (consuming the event), anything else rolls back so
//! the event is redelivered.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence via sqlx and the `stiltctl` binary
//! - `metrics` - Prometheus metrics support

/// Command-line parsing and the composition root.
///
/// [`Cli`](cli::Cli) defines the four subcommands; [`Pipeline`](cli::Pipeline)
/// runs them against any [`Store`].
pub mod cli;

/// Configuration from flags and environment.
///
/// [`SettingsArgs`] is parsed by clap and validated into
/// [`StiltctlConfig`], which carries the [`PersistenceConfig`] and the
/// required [`DeadlinePolicy`].
pub mod config;

/// Domain configs, scene identity and simulation manifests.
pub mod domain;

/// The [`StiltError`] taxonomy and its commit/rollback classification.
pub mod error;

/// Pipeline events and their versioned storage envelope.
pub mod events;

/// Meteorology sources and the cropping tool.
///
/// - [`MeteorologySource`] - archive layout and file naming per model
/// - [`MeteorologyCropper`] - trait for cutting files down to an extent
/// - [`XtrctCropper`] - implementation driving `xtrct_grid`/`xtrct_time`
pub mod meteorology;

#[cfg(feature = "metrics")]
/// Prometheus collectors, updated by [`telemetry`] helpers.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides [`PgStore`](persistence::PgStore) and
/// the [`Schema`](persistence::Schema) it runs against when the `postgres`
/// feature is enabled.
pub mod persistence;

/// Child processes with a hard time limit.
pub mod process;

/// Queue and transaction traits.
///
/// The `queue` module defines [`EventQueue`] for the transactional FIFO,
/// plus [`Store`] and [`StoreTransaction`] for backends that open
/// transactions over the queue and the scene table.
pub mod queue;

/// Worker loop, deadlines and shutdown.
///
/// The `runtime` module provides:
/// - [`Worker`] and [`WorkerConfig`] - polling one stage's queue
/// - [`StageHandler`] - trait binding a stage to its event kind
/// - [`Deadline`] - per-unit time budget
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Scene progress counters and their repository trait.
pub mod scene;

/// The four stage functions and their [`StageHandler`] bindings.
pub mod services;

/// STILT simulation parameters, receptors and the engine trait.
pub mod simulation;

/// Coordinate grids and space-time extents.
pub mod spatial;

/// Artifact buckets.
///
/// [`ArtifactStore`] abstracts one bucket; [`BucketProvider`] resolves
/// bucket names. Local-directory and in-memory backends are provided.
pub mod storage;

/// Tracing setup, spans and `record_*` helpers.
pub mod telemetry;

/// Transaction scoping and the commit/rollback policy.
pub mod unit_of_work;

pub use config::{DatabaseConnection, DatabaseParams, DeadlinePolicy, PersistenceConfig, StiltctlConfig};
pub use domain::{DomainConfig, SceneId, SimulationManifest};
pub use error::{Result, StiltError};
pub use events::{Event, EventId, EventKind, EventRecord, EVENT_SCHEMA_VERSION};
pub use meteorology::{MeteorologyCropper, MeteorologyModel, MeteorologySource, XtrctCropper};
pub use queue::{EventQueue, Store, StoreTransaction};
pub use runtime::{Deadline, PollMode, ShutdownToken, StageHandler, Worker, WorkerConfig, WorkerReport};
pub use scene::{RowLock, SceneRecord, SceneRepository};
pub use simulation::{Receptor, SimulationConfig, SimulationEngine, SimulationOutput, StiltCli};
pub use storage::{ArtifactStore, BucketProvider, LocalBuckets, MemoryArtifactStore, MemoryBuckets};
pub use unit_of_work::{Outcome, UnitOfWork};
