//! STILT simulation parameters, receptors, and the engine that runs them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::SimulationManifest;
use crate::error::{Result, StiltError};
use crate::process::ProcessSpec;
use crate::runtime::Deadline;
use crate::spatial::{round_to, GridExtent, COORDINATE_DIGITS};

/// Extra time granted past the configured simulation timeout before the
/// process is killed.
pub const SIMULATION_GRACE: Duration = Duration::from_secs(10);

/// Run identifier STILT writes its outputs under.
pub const STILT_SIMULATION_ID: &str = "default";

/// Optional STILT tuning parameters accepted in a simulation config.
pub const STILT_PARAMETERS: &[&str] = &[
    "capemin", "cmass", "conage", "cpack", "dxf", "dyf", "dzf", "efile",
    "emisshrs", "frhmax", "frhs", "frme", "frmr", "frts", "frvs",
    "hnf_plume", "horcoruverr", "horcorzierr", "hscale", "ichem", "idsp",
    "initd", "kagl", "kbls", "kblt", "kdef", "khinp", "khmax", "kmixd",
    "kmsl", "kpuff", "krand", "krnd", "kspl", "kwet", "kzmix",
    "maxdim", "maxpar", "mgmin", "n_met_min", "ncycl", "ndump", "ninit",
    "nstr", "nturb", "numpar", "nver", "outdt", "outfrac", "pinbc", "pinpf",
    "poutf", "projection", "qcycle", "random", "rhb", "rht", "rm_dat",
    "siguverr", "sigzierr", "smooth_factor", "splitf", "tkerd", "tkern",
    "tlfrac", "tluverr", "tlzierr", "tout", "tratio", "tvmix", "varsiwant",
    "veght", "vscale", "vscaleu", "vscales", "w_option", "wbbh", "wbwf",
    "wbwr", "wvert", "z_top", "zcoruverr", "zicontroltf", "ziscale",
];

/// A scalar STILT parameter value as written in a config document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Render for the STILT command line: booleans as `T`/`F`, floats
    /// rounded to eight digits.
    pub fn to_cli(&self) -> String {
        match self {
            Self::Bool(true) => "T".to_string(),
            Self::Bool(false) => "F".to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => round_to(*v, COORDINATE_DIGITS).to_string(),
            Self::Text(v) => v.clone(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Physical and numerical parameters for one STILT run.
///
/// `n_hours` may be negative (backward in time). The footprint extent is
/// given by `xmn..xmx`, `ymn..ymx`. Unlisted keys are collected in
/// `parameters` and checked against [`STILT_PARAMETERS`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub n_hours: i32,
    pub xmn: f64,
    pub xmx: f64,
    pub xres: f64,
    pub ymn: f64,
    pub ymx: f64,
    pub yres: f64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub time_integrate: bool,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl SimulationConfig {
    /// Check the footprint extent, resolutions, and parameter names.
    pub fn validate(&self) -> Result<()> {
        self.footprint_extent()?;
        if !(self.xres > 0.0 && self.yres > 0.0) {
            return Err(StiltError::InvalidConfig(format!(
                "footprint resolution must be positive, got xres={} yres={}",
                self.xres, self.yres
            )));
        }
        if let Some(unknown) = self
            .parameters
            .keys()
            .find(|k| !STILT_PARAMETERS.contains(&k.as_str()))
        {
            return Err(StiltError::InvalidConfig(format!(
                "unknown simulation parameter {unknown:?}"
            )));
        }
        Ok(())
    }

    /// Bounding box of the output footprint grid.
    pub fn footprint_extent(&self) -> Result<GridExtent> {
        GridExtent::new(self.xmn, self.xmx, self.ymn, self.ymx)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// `key=value` arguments in a stable order.
    pub fn to_cli_args(&self) -> Vec<String> {
        let fixed = [
            ("n_hours", ParamValue::Integer(i64::from(self.n_hours))),
            ("xmn", ParamValue::Float(self.xmn)),
            ("xmx", ParamValue::Float(self.xmx)),
            ("xres", ParamValue::Float(self.xres)),
            ("ymn", ParamValue::Float(self.ymn)),
            ("ymx", ParamValue::Float(self.ymx)),
            ("yres", ParamValue::Float(self.yres)),
            ("timeout", ParamValue::Integer(self.timeout as i64)),
            ("time_integrate", ParamValue::Bool(self.time_integrate)),
        ];
        fixed
            .iter()
            .map(|(k, v)| format!("{k}={}", v.to_cli()))
            .chain(
                self.parameters
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.to_cli())),
            )
            .collect()
    }
}

fn default_height() -> i32 {
    1
}

/// Where and when particles are released.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Receptor {
    /// A single point near the surface.
    Surface {
        time: DateTime<Utc>,
        longitude: f64,
        latitude: f64,
        #[serde(default = "default_height")]
        height: i32,
    },
    /// A line source between two points.
    Column {
        time: DateTime<Utc>,
        longitude: (f64, f64),
        latitude: (f64, f64),
        height: (i32, i32),
    },
}

impl Receptor {
    pub fn surface(time: DateTime<Utc>, longitude: f64, latitude: f64) -> Self {
        Self::Surface {
            time,
            longitude,
            latitude,
            height: default_height(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Surface { time, .. } | Self::Column { time, .. } => *time,
        }
    }

    /// Stable identifier, also used as the artifact directory.
    pub fn id(&self) -> String {
        let stamp = self.time().format("%Y-%m-%dT%H-%M-%S");
        match self {
            Self::Surface {
                longitude,
                latitude,
                height,
                ..
            } => format!("{stamp}/{longitude}/{latitude}/{height}"),
            Self::Column {
                longitude,
                latitude,
                height,
                ..
            } => format!(
                "{stamp}/{}_{}/{}_{}/{}_{}",
                longitude.0, longitude.1, latitude.0, latitude.1, height.0, height.1
            ),
        }
    }

    /// STILT receptor arguments (`r_run_time`, `r_long`, `r_lati`,
    /// `r_zagl`).
    pub fn to_cli_args(&self) -> Vec<String> {
        let run_time = self.time().format("%Y-%m-%dT%H:%M:%S");
        let coord = |v: f64| round_to(v, COORDINATE_DIGITS).to_string();
        let (long, lati, zagl) = match self {
            Self::Surface {
                longitude,
                latitude,
                height,
                ..
            } => (coord(*longitude), coord(*latitude), height.to_string()),
            Self::Column {
                longitude,
                latitude,
                height,
                ..
            } => (
                format!("{},{}", coord(longitude.0), coord(longitude.1)),
                format!("{},{}", coord(latitude.0), coord(latitude.1)),
                format!("{},{}", height.0, height.1),
            ),
        };
        vec![
            format!("r_run_time={run_time}"),
            format!("r_long={long}"),
            format!("r_lati={lati}"),
            format!("r_zagl={zagl}"),
        ]
    }
}

impl fmt::Display for Receptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Everything a finished simulation left behind.
#[derive(Clone, Debug, Default)]
pub struct SimulationOutput {
    pub stdout: String,
    pub stderr: String,
    pub log: String,
    pub footprint: Option<PathBuf>,
    pub trajectory: Option<PathBuf>,
}

impl SimulationOutput {
    /// The footprint path, or a [`StiltError::SimulationResult`] carrying
    /// every diagnostic stream.
    pub fn require_footprint(&self) -> Result<&Path> {
        self.footprint.as_deref().ok_or_else(|| {
            StiltError::SimulationResult(format!(
                "stdout:\n{}\nstderr:\n{}\nlog:\n{}",
                self.stdout, self.stderr, self.log
            ))
        })
    }
}

/// Executes a single simulation manifest.
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Run `manifest` against the meteorology file at `meteorology`.
    ///
    /// Must finish before `deadline`; a run that outlives its own timeout
    /// fails with [`StiltError::SimulationRuntime`].
    async fn execute(
        &self,
        manifest: &SimulationManifest,
        meteorology: &Path,
        deadline: Deadline,
    ) -> Result<SimulationOutput>;
}

/// Runs STILT through its R command-line entry point.
#[derive(Clone, Debug)]
pub struct StiltCli {
    stilt_path: PathBuf,
}

impl StiltCli {
    pub fn new(stilt_path: impl Into<PathBuf>) -> Self {
        Self {
            stilt_path: stilt_path.into(),
        }
    }

    fn script(&self) -> PathBuf {
        self.stilt_path.join("r").join("stilt_cli.r")
    }

    fn execution_dir(&self) -> PathBuf {
        self.stilt_path
            .join("out")
            .join("by-id")
            .join(STILT_SIMULATION_ID)
    }

    /// Full argument list for `stilt_cli.r`.
    pub fn command_args(
        &self,
        manifest: &SimulationManifest,
        meteorology: &Path,
    ) -> Vec<String> {
        let met_file = meteorology
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let met_dir = meteorology
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let mut args = manifest.config.to_cli_args();
        args.extend(manifest.receptor.to_cli_args());
        args.push(format!("met_file_format={met_file}"));
        args.push(format!("met_path={met_dir}"));
        args.push(format!("stilt_wd={}", self.stilt_path.display()));
        args.push(format!("simulation_id={STILT_SIMULATION_ID}"));
        args
    }

    async fn reap_stragglers(&self) {
        let pkill = ProcessSpec::new(Path::new("pkill")).args(["-f", "hycs_std"]);
        if let Err(err) = pkill.run().await {
            warn!(error = %err, "failed to reap hycs_std processes");
        }
    }

    async fn collect(&self, stdout: String, stderr: String) -> SimulationOutput {
        let dir = self.execution_dir();
        let existing = |name: &str| {
            let path = dir.join(name);
            path.is_file().then_some(path)
        };
        let log_path = dir.join("stilt.log");
        let log = match tokio::fs::read_to_string(&log_path).await {
            Ok(log) => log,
            Err(_) => format!("{} not found.", log_path.display()),
        };
        SimulationOutput {
            stdout,
            stderr,
            log,
            footprint: existing(&format!("{STILT_SIMULATION_ID}_foot.nc")),
            trajectory: existing(&format!("{STILT_SIMULATION_ID}_traj.rds")),
        }
    }
}

#[async_trait]
impl SimulationEngine for StiltCli {
    async fn execute(
        &self,
        manifest: &SimulationManifest,
        meteorology: &Path,
        deadline: Deadline,
    ) -> Result<SimulationOutput> {
        // Outputs share one directory; leftovers would read as success.
        let dir = self.execution_dir();
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        let own_limit = Instant::now() + manifest.config.timeout() + SIMULATION_GRACE;
        let script = self.script();
        let args = self.command_args(manifest, meteorology);
        info!(receptor = %manifest.receptor, "starting simulation");

        let run = ProcessSpec::new(&script)
            .args(args)
            .until(own_limit.min(deadline.instant()))
            .run()
            .await;

        match run {
            Ok(output) => Ok(self.collect(output.stdout, output.stderr).await),
            Err(StiltError::ProcessTimeout { .. }) => {
                self.reap_stragglers().await;
                if deadline.is_expired() {
                    Err(StiltError::DeadlineExceeded(deadline.budget()))
                } else {
                    Err(StiltError::SimulationRuntime(
                        "timeout exceeded".to_string(),
                    ))
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> SimulationConfig {
        serde_yaml::from_str(
            "n_hours: -2\nnumpar: 10\nhnf_plume: false\n\
             xmn: -112.5\nxmx: -111.5\nxres: 0.002\n\
             ymn: 40.1\nymx: 41.2\nyres: 0.002\n",
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults_and_parameters() {
        let config = config();
        assert_eq!(config.timeout, 60);
        assert!(config.time_integrate);
        assert_eq!(config.parameters["numpar"], ParamValue::Integer(10));
        assert_eq!(config.parameters["hnf_plume"], ParamValue::Bool(false));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_rejects_unknown_parameter() {
        let mut config = config();
        config
            .parameters
            .insert("numparr".to_string(), ParamValue::Integer(1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("numparr"));
    }

    #[test]
    fn test_config_cli_args() {
        let args = config().to_cli_args();
        assert_eq!(args[0], "n_hours=-2");
        assert!(args.contains(&"xres=0.002".to_string()));
        assert!(args.contains(&"time_integrate=T".to_string()));
        assert!(args.contains(&"hnf_plume=F".to_string()));
        assert!(args.contains(&"numpar=10".to_string()));
    }

    #[test]
    fn test_surface_receptor_id_and_args() {
        let time = Utc.with_ymd_and_hms(2019, 5, 30, 7, 0, 0).unwrap();
        let receptor = Receptor::surface(time, -112.11, 40.4);
        assert_eq!(receptor.id(), "2019-05-30T07-00-00/-112.11/40.4/1");
        assert_eq!(
            receptor.to_cli_args(),
            vec![
                "r_run_time=2019-05-30T07:00:00",
                "r_long=-112.11",
                "r_lati=40.4",
                "r_zagl=1",
            ]
        );
    }

    #[test]
    fn test_column_receptor_joins_ranges() {
        let time = Utc.with_ymd_and_hms(2019, 5, 30, 7, 0, 0).unwrap();
        let receptor = Receptor::Column {
            time,
            longitude: (-112.0, -111.5),
            latitude: (40.5, 40.75),
            height: (0, 100),
        };
        assert_eq!(receptor.id(), "2019-05-30T07-00-00/-112_-111.5/40.5_40.75/0_100");
        assert!(receptor.to_cli_args().contains(&"r_zagl=0,100".to_string()));
    }

    #[test]
    fn test_missing_footprint_reports_streams() {
        let output = SimulationOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            log: "/x/stilt.log not found.".into(),
            ..Default::default()
        };
        let err = output.require_footprint().unwrap_err();
        assert!(matches!(err, StiltError::SimulationResult(_)));
        let message = err.to_string();
        assert!(message.contains("out") && message.contains("not found"));
    }
}
