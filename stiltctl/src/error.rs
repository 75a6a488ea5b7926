use std::time::Duration;

use thiserror::Error;

use crate::domain::SceneId;
use crate::events::EventKind;

/// Convenience alias used throughout the crate.
pub type Result<T, E = StiltError> = std::result::Result<T, E>;

/// Every failure a pipeline stage can raise.
///
/// The variants fall into three groups that drive the unit-of-work policy:
///
/// - *queue empty* ([`StiltError::NotFound`]), a normal signal rather than a
///   fault;
/// - *expected* domain failures (see [`StiltError::is_expected`]), which
///   commit the consumed event;
/// - everything else, which rolls the transaction back so the event is
///   redelivered.
///
/// [`StiltError::DeadlineExceeded`] is classified separately by the
/// configured [`DeadlinePolicy`](crate::config::DeadlinePolicy).
#[derive(Debug, Error)]
pub enum StiltError {
    #[error("no queued {0} events")]
    NotFound(EventKind),

    #[error("scene {0} already exists")]
    SceneExists(SceneId),

    #[error("meteorology not found: {0}")]
    MeteorologyNotFound(String),

    #[error("meteorology range not supported: {0}")]
    MeteorologyRange(String),

    #[error("simulation produced no footprint: {0}")]
    SimulationResult(String),

    #[error("simulation failed: {0}")]
    SimulationRuntime(String),

    #[error("xtrct_grid failed: {0}")]
    XtrctGrid(String),

    #[error("xtrct_time failed: {0}")]
    XtrctTime(String),

    #[error("stage deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("scene {0} not found")]
    SceneNotFound(SceneId),

    #[error(
        "scene {scene_id} counters out of bounds: \
         {successful} successful of {total} total"
    )]
    CounterInvariant {
        scene_id: SceneId,
        successful: i64,
        total: i64,
    },

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid artifact key: {0}")]
    InvalidArtifactKey(String),

    #[error("invalid domain config: {0}")]
    InvalidConfig(String),

    #[error("event schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: u16, supported: u16 },

    #[error("event record named {record} carries a {payload} payload")]
    KindMismatch { record: String, payload: EventKind },

    #[error("unknown event kind {0:?}")]
    UnknownEventKind(String),

    #[error("no unit of work is active")]
    NoActiveUnitOfWork,

    #[error("a unit of work is already active")]
    UnitOfWorkActive,

    #[error("process {program} exceeded its {limit:?} limit")]
    ProcessTimeout { program: String, limit: Duration },

    #[error("scene counter {0} exceeds the database INTEGER range")]
    CounterOverflow(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StiltError {
    /// Domain failures that consume their event.
    ///
    /// Queue-empty counts as expected; it carries no work to retry.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::SceneExists(_)
                | Self::MeteorologyNotFound(_)
                | Self::MeteorologyRange(_)
                | Self::SimulationResult(_)
                | Self::SimulationRuntime(_)
                | Self::XtrctGrid(_)
                | Self::XtrctTime(_)
        )
    }

    /// True when a dequeue found nothing of the requested kind.
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for stage deadline expiry.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}
