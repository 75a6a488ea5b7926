//! End-to-end pipeline runs through the CLI commands, backed by the
//! in-memory store, memory buckets and mock external tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use stiltctl::cli::{Commands, Pipeline};
use stiltctl::config::StageTimeouts;
use stiltctl::services::{generate_scene, generate_simulations, ExecuteSimulationStage};
use stiltctl::storage::scene_meteorology_key;
use stiltctl::{
    ArtifactStore, DeadlinePolicy, DomainConfig, Event, EventKind, EventQueue, MemoryBuckets,
    PollMode, ShutdownToken, StiltError, Store, StoreTransaction, UnitOfWork, Worker,
    WorkerConfig,
};
use stiltctl_testkit::fixtures::{
    domain_config, domain_config_2x2, domain_config_document, seed_meteorology,
};
use stiltctl_testkit::{EngineBehavior, InMemoryStore, MockCropper, MockEngine};
use tempfile::TempDir;

const ARTIFACT_BUCKET: &str = "stiltctl-artifacts";

struct Harness {
    dir: TempDir,
    store: InMemoryStore,
    buckets: MemoryBuckets,
    engine: MockEngine,
    cropper: MockCropper,
    shutdown: ShutdownToken,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(dir.path().join("engine"));
        Self {
            dir,
            store: InMemoryStore::new(),
            buckets: MemoryBuckets::new(),
            engine,
            cropper: MockCropper::new(),
            shutdown: ShutdownToken::new(),
        }
    }

    fn pipeline(&self, policy: DeadlinePolicy) -> Arc<Pipeline<InMemoryStore>> {
        Arc::new(Pipeline {
            store: Arc::new(self.store.clone()),
            buckets: Arc::new(self.buckets.clone()),
            artifact_bucket: ARTIFACT_BUCKET.to_string(),
            deadline_policy: policy,
            stage_timeouts: StageTimeouts::default(),
            cropper: Arc::new(self.cropper.clone()),
            engine: Arc::new(self.engine.clone()),
            work_dir: self.dir.path().join("work"),
            shutdown: self.shutdown.clone(),
        })
    }

    fn write_configs(&self, documents: &[String]) -> PathBuf {
        let configs = self.dir.path().join("configs");
        std::fs::create_dir_all(&configs).unwrap();
        for (i, document) in documents.iter().enumerate() {
            std::fs::write(configs.join(format!("scene-{i}.yaml")), document).unwrap();
        }
        configs
    }

    fn artifact_keys(&self) -> Vec<String> {
        self.buckets.memory_bucket(ARTIFACT_BUCKET).keys()
    }

    fn unit_of_work(&self) -> UnitOfWork<InMemoryStore> {
        UnitOfWork::new(
            Arc::new(self.store.clone()),
            Arc::new(self.buckets.memory_bucket(ARTIFACT_BUCKET)),
            DeadlinePolicy::Retry,
        )
    }

    /// Create the scene and its simulations directly, skipping meteorology.
    async fn stage_simulations(&self, config: &DomainConfig) {
        self.stage_scene(config).await;
        let sim_config = config.clone();
        self.unit_of_work()
            .run(move |uow| Box::pin(async move { generate_simulations(uow, &sim_config).await }))
            .await
            .unwrap();
    }

    /// Create the scene and its cropped meteorology, with no simulations
    /// queued.
    async fn stage_scene(&self, config: &DomainConfig) {
        let scene_config = config.clone();
        self.unit_of_work()
            .run(move |uow| Box::pin(async move { generate_scene(uow, &scene_config).await }))
            .await
            .unwrap();

        let artifacts = self.buckets.memory_bucket(ARTIFACT_BUCKET);
        artifacts
            .put(
                &scene_meteorology_key(&config.scene_id()),
                Bytes::from_static(b"ARL"),
            )
            .await
            .unwrap();
    }
}

fn generate_scenes(path: PathBuf) -> Commands {
    Commands::GenerateScenes {
        path,
        stage_timeout_secs: None,
    }
}

fn execute(exit_on_empty: bool, backoff_secs: u64, stage_timeout_secs: Option<u64>) -> Commands {
    Commands::ExecuteSimulations {
        exit_on_empty,
        backoff_secs,
        stage_timeout_secs,
    }
}

#[tokio::test]
async fn test_two_by_two_scene_runs_end_to_end() {
    let harness = Harness::new();
    let config = domain_config_2x2();
    let scene_id = config.scene_id();
    seed_meteorology(&harness.buckets, &config).await.unwrap();
    let configs = harness.write_configs(&[domain_config_document(2, 2)]);
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let report = pipeline.run(&generate_scenes(configs)).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(harness.store.scene(&scene_id).unwrap().total_simulations(), 4);

    let report = pipeline
        .run(&Commands::MinimizeMeteorology {
            stage_timeout_secs: None,
        })
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(harness.cropper.calls().len(), 1);
    assert_eq!(harness.cropper.calls()[0].levels, Some(20));
    assert!(harness
        .artifact_keys()
        .contains(&scene_meteorology_key(&scene_id)));

    let report = pipeline
        .run(&Commands::GenerateSimulations {
            stage_timeout_secs: None,
        })
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(harness.store.queued(EventKind::SimulationCreated), 4);

    let report = pipeline.run(&execute(true, 10, None)).await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 0);
    harness.engine.assert_run_count_eq(4);

    let scene = harness.store.scene(&scene_id).unwrap();
    assert_eq!(scene.successful_simulations(), 4);
    assert!(scene.is_complete());

    let keys = harness.artifact_keys();
    for manifest in config.simulation_manifests() {
        let id = manifest.simulation_id();
        assert!(keys.contains(&format!("by-simulation-id/{id}/footprint.nc")));
        assert!(keys.contains(&format!("by-simulation-id/{id}/trajectories.rds")));
    }
    for kind in EventKind::ALL {
        assert_eq!(harness.store.queued(kind), 0, "{kind} drained");
    }
}

#[tokio::test]
async fn test_duplicate_scene_is_skipped() {
    let harness = Harness::new();
    let configs = harness.write_configs(&[domain_config_document(2, 2)]);
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    pipeline.run(&generate_scenes(configs.clone())).await.unwrap();
    let report = pipeline.run(&generate_scenes(configs)).await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(harness.store.scene_count(), 1);
    assert_eq!(harness.store.queued(EventKind::SceneCreated), 1);
}

#[tokio::test]
async fn test_invalid_documents_are_skipped() {
    let harness = Harness::new();
    let configs = harness.write_configs(&[
        domain_config_document(1, 1),
        "receptor_grid: [not, a, grid]\n".to_string(),
    ]);
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let report = pipeline.run(&generate_scenes(configs)).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(harness.store.queued(EventKind::SceneCreated), 1);
}

#[tokio::test]
async fn test_missing_meteorology_consumes_scene_event() {
    let harness = Harness::new();
    let configs = harness.write_configs(&[domain_config_document(2, 2)]);
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);
    pipeline.run(&generate_scenes(configs)).await.unwrap();

    let report = pipeline
        .run(&Commands::MinimizeMeteorology {
            stage_timeout_secs: None,
        })
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert!(harness.cropper.calls().is_empty());
    assert_eq!(harness.store.queued(EventKind::SceneCreated), 0);
    assert_eq!(harness.store.queued(EventKind::MeteorologyMinimized), 0);
}

#[tokio::test]
async fn test_missing_footprint_is_an_expected_failure() {
    let harness = Harness::new();
    harness.engine.set_behavior(EngineBehavior::NoFootprint);
    let config = domain_config_2x2();
    harness.stage_simulations(&config).await;
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let report = pipeline.run(&execute(true, 10, None)).await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 4);
    let scene = harness.store.scene(&config.scene_id()).unwrap();
    assert_eq!(scene.successful_simulations(), 0);
    assert_eq!(harness.store.queued(EventKind::SimulationCreated), 0);
    assert!(!harness
        .artifact_keys()
        .iter()
        .any(|key| key.ends_with("footprint.nc")));
}

#[tokio::test]
async fn test_stage_deadline_with_retry_keeps_event() {
    let harness = Harness::new();
    harness
        .engine
        .set_behavior(EngineBehavior::Sleep(Duration::from_secs(30)));
    let config = domain_config(1, 1);
    harness.stage_simulations(&config).await;
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let result = pipeline.run(&execute(true, 10, Some(1))).await;

    assert!(matches!(result, Err(StiltError::DeadlineExceeded(_))));
    assert_eq!(harness.store.queued(EventKind::SimulationCreated), 1);
    assert_eq!(
        harness.store.scene(&config.scene_id()).unwrap().successful_simulations(),
        0
    );
}

async fn run_contended(simulations: usize, workers: usize) {
    let harness = Harness::new();
    let config = domain_config(simulations, 1);
    harness.stage_simulations(&config).await;
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let mut handles = Vec::new();
    for _ in 0..workers {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.run(&execute(true, 10, None)).await
        }));
    }
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().unwrap().processed;
    }

    assert_eq!(processed, simulations as u64);
    harness.engine.assert_run_count_eq(simulations);
    let scene = harness.store.scene(&config.scene_id()).unwrap();
    assert_eq!(scene.successful_simulations() as usize, simulations);
    assert!(scene.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_exact_with_single_simulation() {
    run_contended(1, 4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_exact_with_ten_simulations() {
    run_contended(10, 4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_exact_with_hundred_simulations() {
    run_contended(100, 8).await;
}

#[tokio::test]
async fn test_drain_exits_on_empty_queue() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.run(&execute(true, 10, None)),
    )
    .await
    .expect("drain should not wait for the backoff")
    .unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_continuous_worker_stops_on_shutdown() {
    let harness = Harness::new();
    let config = domain_config(2, 1);
    harness.stage_simulations(&config).await;
    let pipeline = harness.pipeline(DeadlinePolicy::Retry);

    let worker = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run(&execute(false, 3600, None)).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.shutdown.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(report.processed, 2);
    assert!(harness
        .store
        .scene(&config.scene_id())
        .unwrap()
        .is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_continuous_worker_waits_for_late_events() {
    let harness = Harness::new();
    let config = domain_config(1, 1);
    let scene_id = config.scene_id();
    harness.stage_scene(&config).await;

    let worker_config = WorkerConfig::new("execute-simulations-test")
        .with_poll_mode(PollMode::Continuous)
        .with_backoff(50)
        .with_stage_timeout(Duration::from_secs(30));
    let stage = ExecuteSimulationStage::new(
        Arc::new(harness.engine.clone()),
        harness.dir.path().join("work"),
    );
    let worker = Worker::new(
        worker_config,
        harness.unit_of_work(),
        stage,
        harness.shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished(), "worker must keep polling an empty queue");
    harness.engine.assert_run_count_eq(0);

    let manifest = config.simulation_manifests().remove(0);
    let mut tx = harness.store.begin().await.unwrap();
    tx.enqueue(&Event::SimulationCreated { manifest }).await.unwrap();
    tx.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.store.scene(&scene_id).unwrap().successful_simulations() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("late event should be processed");
    assert_eq!(harness.store.queued(EventKind::SimulationCreated), 0);

    harness.shutdown.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    harness.engine.assert_run_count_eq(1);
}
