//! The four pipeline stages.
//!
//! Each stage function runs inside a caller-provided [`UnitOfWork`]; the
//! `*Stage` types bind the event-driven ones to a [`StageHandler`] so a
//! [`Worker`](crate::runtime::Worker) can poll for them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn, Instrument};

use crate::domain::{DomainConfig, SceneId, SimulationManifest};
use crate::error::{Result, StiltError};
use crate::events::{Event, EventKind};
use crate::meteorology::MeteorologyCropper;
use crate::queue::Store;
use crate::runtime::{Deadline, StageHandler};
use crate::scene::{RowLock, SceneRecord};
use crate::simulation::SimulationEngine;
use crate::storage::{
    scene_meteorology_key, simulation_artifact_key, ArtifactStore, BucketProvider,
};
use crate::telemetry::{record_events_enqueued, record_scene_progress, simulation_span};
use crate::unit_of_work::UnitOfWork;

/// Vertical levels kept when cropping meteorology.
pub const CROP_VERTICAL_LEVELS: u32 = 20;

/// Register a scene and queue it for meteorology.
///
/// A second submission of the same config fails with
/// [`StiltError::SceneExists`] and writes nothing.
pub async fn generate_scene<S: Store>(
    uow: &mut UnitOfWork<S>,
    domain_config: &DomainConfig,
) -> Result<SceneId> {
    let scene_id = domain_config.scene_id();
    let total = u32::try_from(domain_config.simulation_count()).map_err(|_| {
        StiltError::InvalidConfig(format!(
            "receptor grid of {} points is too large",
            domain_config.simulation_count()
        ))
    })?;

    uow.scenes()?
        .create_scene(&SceneRecord::new(scene_id.clone(), total))
        .await?;
    uow.events()?
        .enqueue(&Event::SceneCreated {
            domain_config: domain_config.clone(),
        })
        .await?;
    record_events_enqueued(EventKind::SceneCreated, 1);

    info!(scene_id = %scene_id, simulations = total, "scene created");
    Ok(scene_id)
}

fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Fetch, crop and store the meteorology a scene needs, then queue it for
/// simulation generation.
pub async fn minimize_meteorology<S: Store>(
    uow: &mut UnitOfWork<S>,
    domain_config: &DomainConfig,
    buckets: &dyn BucketProvider,
    cropper: &dyn MeteorologyCropper,
    work_dir: &Path,
    deadline: Deadline,
) -> Result<()> {
    let scene_id = domain_config.scene_id();
    let extent = domain_config.meteorology_extent()?;
    let source = domain_config.meteorology_model().source();
    if let Some(parent) = source.extent() {
        if !parent.contains(extent.extent()) {
            warn!(scene_id = %scene_id, ?extent, "scene extends beyond the meteorology domain");
        }
    }
    let filenames = source.filenames_by_time_range(extent.tmin(), extent.tmax())?;

    tokio::fs::create_dir_all(work_dir).await?;
    let scratch = tempfile::tempdir_in(work_dir)?;
    let archive = buckets.bucket(source.artifact_bucket());

    let mut inputs = Vec::with_capacity(filenames.len());
    for filename in &filenames {
        let local = scratch.path().join(key_basename(filename));
        match archive.download(filename, &local).await {
            Ok(()) => inputs.push(local),
            Err(StiltError::ArtifactNotFound(key)) => {
                return Err(StiltError::MeteorologyNotFound(format!(
                    "{}/{key}",
                    source.artifact_bucket()
                )));
            }
            Err(err) => return Err(err),
        }
    }

    let cropped = scratch.path().join("meteorology.arl");
    cropper
        .crop(&inputs, &cropped, &extent, Some(CROP_VERTICAL_LEVELS), deadline)
        .await?;
    uow.artifacts()?
        .upload(&scene_meteorology_key(&scene_id), &cropped)
        .await?;

    uow.events()?
        .enqueue(&Event::MeteorologyMinimized {
            domain_config: domain_config.clone(),
        })
        .await?;
    record_events_enqueued(EventKind::MeteorologyMinimized, 1);

    info!(scene_id = %scene_id, files = filenames.len(), "meteorology minimized");
    Ok(())
}

/// Queue one simulation per receptor grid point.
pub async fn generate_simulations<S: Store>(
    uow: &mut UnitOfWork<S>,
    domain_config: &DomainConfig,
) -> Result<usize> {
    let events: Vec<Event> = domain_config
        .simulation_manifests()
        .into_iter()
        .map(|manifest| Event::SimulationCreated { manifest })
        .collect();
    uow.events()?.enqueue_many(&events).await?;
    record_events_enqueued(EventKind::SimulationCreated, events.len());

    info!(
        scene_id = %domain_config.scene_id(),
        simulations = events.len(),
        "simulations generated"
    );
    Ok(events.len())
}

/// Local copy of a scene's meteorology, downloaded on first use.
///
/// The cache file appears atomically, so concurrent executors on one host
/// never read a partial download.
async fn cached_meteorology(
    artifacts: &dyn ArtifactStore,
    scene_id: &SceneId,
    work_dir: &Path,
) -> Result<PathBuf> {
    let cached = work_dir.join(format!("{scene_id}.arl"));
    if tokio::fs::try_exists(&cached).await? {
        return Ok(cached);
    }

    tokio::fs::create_dir_all(work_dir).await?;
    let staged = tempfile::NamedTempFile::new_in(work_dir)?.into_temp_path();
    let key = scene_meteorology_key(scene_id);
    match artifacts.download(&key, &staged).await {
        Ok(()) => {}
        Err(StiltError::ArtifactNotFound(key)) => {
            return Err(StiltError::MeteorologyNotFound(key));
        }
        Err(err) => return Err(err),
    }
    staged
        .persist(&cached)
        .map_err(|err| StiltError::Io(err.error))?;
    Ok(cached)
}

/// Run one simulation, store its outputs and count it against its scene.
///
/// Returns the scene counters after the increment.
pub async fn execute_simulation<S: Store>(
    uow: &mut UnitOfWork<S>,
    manifest: &SimulationManifest,
    engine: &dyn SimulationEngine,
    work_dir: &Path,
    deadline: Deadline,
) -> Result<SceneRecord> {
    let simulation_id = manifest.simulation_id();
    let artifacts = uow.artifacts()?;
    let meteorology = cached_meteorology(artifacts.as_ref(), &manifest.scene_id, work_dir).await?;

    let output = engine
        .execute(manifest, &meteorology, deadline)
        .instrument(simulation_span(&manifest.scene_id, &simulation_id))
        .await?;
    let footprint = output.require_footprint()?;
    let trajectory = output.trajectory.as_deref().ok_or_else(|| {
        StiltError::SimulationResult(format!("{simulation_id} wrote no trajectories"))
    })?;

    artifacts
        .upload(&simulation_artifact_key(&simulation_id, "footprint.nc"), footprint)
        .await?;
    artifacts
        .upload(&simulation_artifact_key(&simulation_id, "trajectories.rds"), trajectory)
        .await?;

    let mut scene = uow
        .scenes()?
        .get_scene(&manifest.scene_id, RowLock::ForUpdate)
        .await?;
    scene.record_success()?;
    uow.scenes()?.save_scene(&scene).await?;
    record_scene_progress(
        scene.scene_id(),
        scene.successful_simulations(),
        scene.total_simulations(),
    );

    info!(
        scene_id = %scene.scene_id(),
        simulation_id = %simulation_id,
        "Scene completion: {}/{} ({:.1}%)",
        scene.successful_simulations(),
        scene.total_simulations(),
        scene.percent_complete()
    );
    if scene.is_complete() {
        // TODO: dispatch a scene-completed event so the inversion service can
        // assemble the row-oriented jacobian for this scene.
        info!(scene_id = %scene.scene_id(), "scene complete");
    }
    Ok(scene)
}

fn unexpected_event(expected: EventKind, event: &Event) -> StiltError {
    StiltError::KindMismatch {
        record: expected.as_str().to_string(),
        payload: event.kind(),
    }
}

/// Consumes `scene_created`; produces `meteorology_minimized`.
#[derive(Clone)]
pub struct MinimizeMeteorologyStage {
    buckets: Arc<dyn BucketProvider>,
    cropper: Arc<dyn MeteorologyCropper>,
    work_dir: PathBuf,
}

impl MinimizeMeteorologyStage {
    pub fn new(
        buckets: Arc<dyn BucketProvider>,
        cropper: Arc<dyn MeteorologyCropper>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            buckets,
            cropper,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl<S: Store> StageHandler<S> for MinimizeMeteorologyStage {
    fn name(&self) -> &'static str {
        "minimize-meteorology"
    }

    fn consumes(&self) -> EventKind {
        EventKind::SceneCreated
    }

    async fn handle(&self, uow: &mut UnitOfWork<S>, event: Event, deadline: Deadline) -> Result<()> {
        let domain_config = match event {
            Event::SceneCreated { domain_config } => domain_config,
            other => return Err(unexpected_event(EventKind::SceneCreated, &other)),
        };
        minimize_meteorology(
            uow,
            &domain_config,
            self.buckets.as_ref(),
            self.cropper.as_ref(),
            &self.work_dir,
            deadline,
        )
        .await
    }
}

/// Consumes `meteorology_minimized`; produces `simulation_created`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenerateSimulationsStage;

#[async_trait]
impl<S: Store> StageHandler<S> for GenerateSimulationsStage {
    fn name(&self) -> &'static str {
        "generate-simulations"
    }

    fn consumes(&self) -> EventKind {
        EventKind::MeteorologyMinimized
    }

    async fn handle(&self, uow: &mut UnitOfWork<S>, event: Event, _deadline: Deadline) -> Result<()> {
        let domain_config = match event {
            Event::MeteorologyMinimized { domain_config } => domain_config,
            other => return Err(unexpected_event(EventKind::MeteorologyMinimized, &other)),
        };
        generate_simulations(uow, &domain_config).await.map(|_| ())
    }
}

/// Consumes `simulation_created`; updates scene counters.
#[derive(Clone)]
pub struct ExecuteSimulationStage {
    engine: Arc<dyn SimulationEngine>,
    work_dir: PathBuf,
}

impl ExecuteSimulationStage {
    pub fn new(engine: Arc<dyn SimulationEngine>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl<S: Store> StageHandler<S> for ExecuteSimulationStage {
    fn name(&self) -> &'static str {
        "execute-simulations"
    }

    fn consumes(&self) -> EventKind {
        EventKind::SimulationCreated
    }

    async fn handle(&self, uow: &mut UnitOfWork<S>, event: Event, deadline: Deadline) -> Result<()> {
        let manifest = match event {
            Event::SimulationCreated { manifest } => manifest,
            other => return Err(unexpected_event(EventKind::SimulationCreated, &other)),
        };
        execute_simulation(uow, &manifest, self.engine.as_ref(), &self.work_dir, deadline)
            .await
            .map(|_| ())
    }
}
