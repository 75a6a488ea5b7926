//! Scene definitions and the manifests derived from them.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::{Result, StiltError};
use crate::meteorology::MeteorologyModel;
use crate::simulation::{Receptor, SimulationConfig};
use crate::spatial::{Grid, GridTimeExtent};

/// Spatial padding applied around the footprint when sizing meteorology.
pub const METEOROLOGY_PAD_DEGREES: f64 = 0.25;

/// Truncate `time` to the start of its hour.
pub fn floor_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    let secs = time.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(time)
}

/// Content-derived identity of a [`DomainConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(String);

impl SceneId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_reference_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| StiltError::InvalidConfig(format!("unparseable time {raw:?}")))
}

#[derive(Deserialize)]
struct DomainConfigDocument {
    receptor_grid: Grid,
    simulation_config: SimulationConfig,
    meteorology_model: MeteorologyModel,
    #[serde(default)]
    time: Option<String>,
}

impl TryFrom<DomainConfigDocument> for DomainConfig {
    type Error = StiltError;

    fn try_from(doc: DomainConfigDocument) -> Result<Self> {
        let time = doc.time.as_deref().map(parse_reference_time).transpose()?;
        DomainConfig::new(
            doc.receptor_grid,
            doc.simulation_config,
            doc.meteorology_model,
            time,
        )
    }
}

/// Everything needed to reproduce one scene.
///
/// Immutable once built. The reference time is always on an hour boundary,
/// and the [`SceneId`] is the SHA-256 of the canonical JSON form, so two
/// documents that differ only in omitted defaults share an identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DomainConfigDocument")]
pub struct DomainConfig {
    receptor_grid: Grid,
    simulation_config: SimulationConfig,
    meteorology_model: MeteorologyModel,
    time: DateTime<Utc>,
    #[serde(skip_serializing)]
    scene_id: SceneId,
}

impl DomainConfig {
    /// Validate and build. `time` defaults to the current hour.
    pub fn new(
        receptor_grid: Grid,
        simulation_config: SimulationConfig,
        meteorology_model: MeteorologyModel,
        time: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        simulation_config.validate()?;
        let mut config = Self {
            receptor_grid,
            simulation_config,
            meteorology_model,
            time: floor_to_hour(time.unwrap_or_else(Utc::now)),
            scene_id: SceneId(String::new()),
        };
        // Struct fields serialize in declaration order and parameter maps
        // are sorted, so the JSON form is canonical.
        let canonical = serde_json::to_vec(&config)?;
        config.scene_id = SceneId(hex::encode(Sha256::digest(&canonical)));
        Ok(config)
    }

    pub fn receptor_grid(&self) -> &Grid {
        &self.receptor_grid
    }

    pub fn simulation_config(&self) -> &SimulationConfig {
        &self.simulation_config
    }

    pub fn meteorology_model(&self) -> MeteorologyModel {
        self.meteorology_model
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Computed once at construction.
    pub fn scene_id(&self) -> SceneId {
        self.scene_id.clone()
    }

    /// One manifest per receptor grid point, x-major.
    pub fn simulation_manifests(&self) -> Vec<SimulationManifest> {
        let scene_id = self.scene_id();
        self.receptor_grid
            .points()
            .into_iter()
            .map(|p| SimulationManifest {
                scene_id: scene_id.clone(),
                config: self.simulation_config.clone(),
                receptor: Receptor::surface(self.time, p.x, p.y),
            })
            .collect()
    }

    pub fn simulation_count(&self) -> usize {
        self.receptor_grid.point_count()
    }

    /// Space-time extent of meteorology needed by every simulation.
    ///
    /// The footprint box is padded by [`METEOROLOGY_PAD_DEGREES`]; the time
    /// window spans the run in either direction, gains an hour of padding,
    /// and is snapped outward to whole hours.
    pub fn meteorology_extent(&self) -> Result<GridTimeExtent> {
        let run_end = self.time + Duration::hours(i64::from(self.simulation_config.n_hours));
        let footprint = GridTimeExtent::new(
            self.simulation_config.footprint_extent()?,
            self.time,
            run_end,
        );
        let padded = footprint.expand(
            METEOROLOGY_PAD_DEGREES,
            METEOROLOGY_PAD_DEGREES,
            Duration::hours(1),
        );
        Ok(padded.with_times(
            floor_to_hour(padded.tmin()),
            floor_to_hour(padded.tmax() + Duration::hours(1)),
        ))
    }

    pub fn from_yaml(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// One simulation's worth of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationManifest {
    pub scene_id: SceneId,
    pub config: SimulationConfig,
    pub receptor: Receptor,
}

impl SimulationManifest {
    pub fn simulation_id(&self) -> String {
        self.receptor.id()
    }
}

/// Load every `*.yaml`/`*.yml` document under `path`, or `path` itself when
/// it is a file. Documents that fail to parse are logged and skipped.
pub fn load_domain_configs(path: &Path) -> Result<Vec<DomainConfig>> {
    let mut files = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let file = entry?.path();
            let is_yaml = file
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml && file.is_file() {
                files.push(file);
            }
        }
        files
    };
    files.sort();

    if files.is_empty() {
        warn!(path = %path.display(), "no domain config documents found");
    }

    let mut configs = Vec::with_capacity(files.len());
    for file in files {
        let loaded = std::fs::read_to_string(&file)
            .map_err(StiltError::from)
            .and_then(|text| DomainConfig::from_yaml(&text));
        match loaded {
            Ok(config) => {
                info!(file = %file.display(), scene_id = %config.scene_id(), "loaded domain config");
                configs.push(config);
            }
            Err(err) => {
                error!(file = %file.display(), error = %err, "skipping invalid domain config");
            }
        }
    }
    Ok(configs)
}
