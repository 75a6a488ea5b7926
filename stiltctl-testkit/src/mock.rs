use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stiltctl::meteorology::MeteorologyCropper;
use stiltctl::spatial::GridTimeExtent;
use stiltctl::{Deadline, Result, SimulationEngine, SimulationManifest, SimulationOutput, StiltError};

/// What [`MockEngine`] does when asked to run a simulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineBehavior {
    /// Write a footprint and trajectory file.
    Succeed,
    /// Exit cleanly without writing a footprint.
    NoFootprint,
    /// Fail as STILT does when it overruns its own timeout.
    RuntimeFailure(String),
    /// Sleep, then succeed.
    Sleep(Duration),
}

/// Scripted [`SimulationEngine`] that records every manifest it runs.
#[derive(Clone)]
pub struct MockEngine {
    output_root: PathBuf,
    behavior: Arc<Mutex<EngineBehavior>>,
    runs: Arc<Mutex<Vec<SimulationManifest>>>,
    meteorology: Arc<Mutex<Vec<PathBuf>>>,
    counter: Arc<AtomicU64>,
}

impl MockEngine {
    /// Outputs are written under `output_root`.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self::with_behavior(output_root, EngineBehavior::Succeed)
    }

    pub fn with_behavior(output_root: impl Into<PathBuf>, behavior: EngineBehavior) -> Self {
        Self {
            output_root: output_root.into(),
            behavior: Arc::new(Mutex::new(behavior)),
            runs: Arc::new(Mutex::new(Vec::new())),
            meteorology: Arc::new(Mutex::new(Vec::new())),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_behavior(&self, behavior: EngineBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Manifests passed to `execute`, in call order.
    pub fn runs(&self) -> Vec<SimulationManifest> {
        self.runs.lock().clone()
    }

    /// Meteorology paths passed to `execute`, in call order.
    pub fn meteorology_paths(&self) -> Vec<PathBuf> {
        self.meteorology.lock().clone()
    }

    pub fn assert_run_count_eq(&self, expected: usize) {
        let actual = self.runs.lock().len();
        assert_eq!(actual, expected, "Expected {expected} runs, got {actual}");
    }
}

#[async_trait]
impl SimulationEngine for MockEngine {
    async fn execute(
        &self,
        manifest: &SimulationManifest,
        meteorology: &Path,
        _deadline: Deadline,
    ) -> Result<SimulationOutput> {
        self.runs.lock().push(manifest.clone());
        self.meteorology.lock().push(meteorology.to_path_buf());
        let behavior = self.behavior.lock().clone();

        let run = self.counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.output_root.join(format!("run-{run}"));
        tokio::fs::create_dir_all(&dir).await?;
        let trajectory = dir.join("default_traj.rds");
        tokio::fs::write(&trajectory, manifest.simulation_id()).await?;

        let mut output = SimulationOutput {
            stdout: format!("simulating {}", manifest.simulation_id()),
            log: "mock engine".to_string(),
            trajectory: Some(trajectory),
            ..SimulationOutput::default()
        };

        match behavior {
            EngineBehavior::Succeed => {}
            EngineBehavior::NoFootprint => {
                output.stderr = "footprint grid empty".to_string();
                return Ok(output);
            }
            EngineBehavior::RuntimeFailure(message) => {
                return Err(StiltError::SimulationRuntime(message));
            }
            EngineBehavior::Sleep(duration) => tokio::time::sleep(duration).await,
        }

        let footprint = dir.join("default_foot.nc");
        tokio::fs::write(&footprint, manifest.receptor.id()).await?;
        output.footprint = Some(footprint);
        Ok(output)
    }
}

/// A recorded [`MockCropper::crop`] call.
#[derive(Clone, Debug)]
pub struct CropRecord {
    pub inputs: Vec<PathBuf>,
    pub extent: GridTimeExtent,
    pub levels: Option<u32>,
}

/// [`MeteorologyCropper`] that concatenates its inputs.
#[derive(Clone, Default)]
pub struct MockCropper {
    calls: Arc<Mutex<Vec<CropRecord>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockCropper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every later call with [`StiltError::XtrctGrid`].
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    pub fn calls(&self) -> Vec<CropRecord> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MeteorologyCropper for MockCropper {
    async fn crop(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        extent: &GridTimeExtent,
        levels: Option<u32>,
        _deadline: Deadline,
    ) -> Result<()> {
        self.calls.lock().push(CropRecord {
            inputs: inputs.to_vec(),
            extent: *extent,
            levels,
        });
        let failure = self.failure.lock().clone();
        if let Some(message) = failure {
            return Err(StiltError::XtrctGrid(message));
        }

        let mut cropped = Vec::new();
        for input in inputs {
            cropped.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, cropped).await?;
        Ok(())
    }
}
