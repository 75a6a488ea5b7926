//! Scene progress tracking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::SceneId;
use crate::error::{Result, StiltError};

/// Whether a read should take the row lock until the transaction ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowLock {
    None,
    ForUpdate,
}

/// Simulation counters for one scene.
///
/// `successful_simulations` never exceeds `total_simulations`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRecord {
    scene_id: SceneId,
    successful_simulations: u32,
    total_simulations: u32,
}

impl SceneRecord {
    /// A fresh scene with no completed simulations.
    pub fn new(scene_id: SceneId, total_simulations: u32) -> Self {
        Self {
            scene_id,
            successful_simulations: 0,
            total_simulations,
        }
    }

    /// Rebuild from stored counters, rejecting out-of-range values.
    pub fn restore(scene_id: SceneId, successful: i64, total: i64) -> Result<Self> {
        let counters = u32::try_from(successful)
            .ok()
            .zip(u32::try_from(total).ok())
            .filter(|(s, t)| s <= t);
        match counters {
            Some((successful_simulations, total_simulations)) => Ok(Self {
                scene_id,
                successful_simulations,
                total_simulations,
            }),
            None => Err(StiltError::CounterInvariant {
                scene_id,
                successful,
                total,
            }),
        }
    }

    pub fn scene_id(&self) -> &SceneId {
        &self.scene_id
    }

    pub fn successful_simulations(&self) -> u32 {
        self.successful_simulations
    }

    pub fn total_simulations(&self) -> u32 {
        self.total_simulations
    }

    /// Count one more successful simulation.
    pub fn record_success(&mut self) -> Result<()> {
        if self.successful_simulations >= self.total_simulations {
            return Err(StiltError::CounterInvariant {
                scene_id: self.scene_id.clone(),
                successful: i64::from(self.successful_simulations) + 1,
                total: i64::from(self.total_simulations),
            });
        }
        self.successful_simulations += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.successful_simulations == self.total_simulations
    }

    /// Completion percentage; an empty scene counts as complete.
    pub fn percent_complete(&self) -> f64 {
        if self.total_simulations == 0 {
            return 100.0;
        }
        100.0 * f64::from(self.successful_simulations) / f64::from(self.total_simulations)
    }
}

/// Scene rows, scoped to the caller's transaction.
#[async_trait]
pub trait SceneRepository: Send {
    /// Insert a new scene; fails with [`StiltError::SceneExists`] on a
    /// duplicate id without poisoning the transaction.
    async fn create_scene(&mut self, scene: &SceneRecord) -> Result<()>;

    /// Read a scene, optionally holding its row lock until the transaction
    /// ends.
    async fn get_scene(&mut self, scene_id: &SceneId, lock: RowLock) -> Result<SceneRecord>;

    /// Persist updated counters.
    async fn save_scene(&mut self, scene: &SceneRecord) -> Result<()>;
}
