use bytes::Bytes;
use stiltctl::{ArtifactStore, DomainConfig, MemoryBuckets, Result};

/// Receptor grid spacing used by [`domain_config`].
pub const GRID_STEP: f64 = 0.01;

/// A valid YAML document for an `nx` by `ny` receptor grid over Salt Lake
/// City, with a fixed reference time.
pub fn domain_config_document(nx: usize, ny: usize) -> String {
    let xmin = -112.11;
    let ymin = 40.4;
    let xmax = xmin + GRID_STEP * nx.saturating_sub(1) as f64;
    let ymax = ymin + GRID_STEP * ny.saturating_sub(1) as f64;
    format!(
        "\
receptor_grid:
  xmin: {xmin}
  xmax: {xmax:.8}
  xres: {GRID_STEP}
  ymin: {ymin}
  ymax: {ymax:.8}
  yres: {GRID_STEP}
simulation_config:
  n_hours: -2
  numpar: 10
  xmn: -112.5
  xmx: -111.5
  xres: 0.002
  ymn: 40.1
  ymx: 41.2
  yres: 0.002
meteorology_model: hrrr
time: 2019-05-30 07:00:00
"
    )
}

/// Parsed form of [`domain_config_document`].
pub fn domain_config(nx: usize, ny: usize) -> DomainConfig {
    DomainConfig::from_yaml(&domain_config_document(nx, ny))
        .expect("fixture document should be valid")
}

/// The 2x2 scene used by the end-to-end tests.
pub fn domain_config_2x2() -> DomainConfig {
    domain_config(2, 2)
}

/// Put a placeholder file in the meteorology archive for every key the
/// config's scene will ask for. Returns the keys written.
pub async fn seed_meteorology(buckets: &MemoryBuckets, config: &DomainConfig) -> Result<Vec<String>> {
    let source = config.meteorology_model().source();
    let extent = config.meteorology_extent()?;
    let keys = source.filenames_by_time_range(extent.tmin(), extent.tmax())?;
    let archive = buckets.memory_bucket(source.artifact_bucket());
    for key in &keys {
        archive
            .put(key, Bytes::from(format!("ARL {key}\n")))
            .await?;
    }
    Ok(keys)
}
