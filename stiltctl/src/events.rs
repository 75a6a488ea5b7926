use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DomainConfig, SimulationManifest};
use crate::error::{Result, StiltError};

/// Highest envelope version this build understands.
pub const EVENT_SCHEMA_VERSION: u16 = 1;

/// Work handed from one pipeline stage to the next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A scene was registered and needs meteorology.
    SceneCreated { domain_config: DomainConfig },
    /// Cropped meteorology for the scene is in the artifact store.
    MeteorologyMinimized { domain_config: DomainConfig },
    /// One simulation is ready to run.
    SimulationCreated { manifest: SimulationManifest },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SceneCreated { .. } => EventKind::SceneCreated,
            Self::MeteorologyMinimized { .. } => EventKind::MeteorologyMinimized,
            Self::SimulationCreated { .. } => EventKind::SimulationCreated,
        }
    }

    /// Wrap in the current envelope for storage.
    pub fn encode(&self) -> Result<EncodedEvent> {
        let envelope = EventEnvelope {
            version: EVENT_SCHEMA_VERSION,
            event: self.clone(),
        };
        Ok(EncodedEvent {
            event_name: self.kind().as_str().to_string(),
            event_data: serde_json::to_value(envelope)?,
        })
    }
}

/// Discriminator stored alongside each queued event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SceneCreated,
    MeteorologyMinimized,
    SimulationCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::SceneCreated,
        EventKind::MeteorologyMinimized,
        EventKind::SimulationCreated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SceneCreated => "scene_created",
            Self::MeteorologyMinimized => "meteorology_minimized",
            Self::SimulationCreated => "simulation_created",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = StiltError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StiltError::UnknownEventKind(s.to_string()))
    }
}

/// Versioned wrapper persisted in `event_data`.
///
/// Readers accept any version up to [`EVENT_SCHEMA_VERSION`]; payload fields
/// added later must be optional so older envelopes still decode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u16,
    pub event: Event,
}

/// Event ready to insert.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedEvent {
    pub event_name: String,
    pub event_data: serde_json::Value,
}

/// Queue-assigned event identifier; ascending ids give FIFO order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored queue row.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub id: EventId,
    pub created_at: DateTime<Utc>,
    pub event_name: String,
    pub event_data: serde_json::Value,
}

impl EventRecord {
    /// Decode the payload, checking version and kind against the row.
    pub fn decode(&self) -> Result<Event> {
        let envelope: EventEnvelope = serde_json::from_value(self.event_data.clone())?;
        if envelope.version > EVENT_SCHEMA_VERSION {
            return Err(StiltError::UnsupportedSchema {
                found: envelope.version,
                supported: EVENT_SCHEMA_VERSION,
            });
        }
        let payload = envelope.event.kind();
        if payload.as_str() != self.event_name {
            return Err(StiltError::KindMismatch {
                record: self.event_name.clone(),
                payload,
            });
        }
        Ok(envelope.event)
    }
}
