//! Upstream meteorology archives and ARL file cropping.
//!
//! Each [`MeteorologyModel`] resolves to a [`MeteorologySource`] that knows
//! how the archive names its files. [`XtrctCropper`] shrinks those files to a
//! scene's space-time extent using HYSPLIT's `xtrct_grid` and `xtrct_time`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::domain::floor_to_hour;
use crate::error::{Result, StiltError};
use crate::process::{ProcessOutput, ProcessSpec};
use crate::runtime::Deadline;
use crate::spatial::{GridExtent, GridTimeExtent};

/// Upstream meteorological models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteorologyModel {
    Hrrr,
    HrrrForecast,
}

impl MeteorologyModel {
    pub fn source(self) -> MeteorologySource {
        let hrrr_domain = GridExtent::new(-122.71902, -60.9162, 12.1381, 47.8419);
        match self {
            Self::Hrrr => MeteorologySource {
                model: self,
                artifact_bucket: "high-resolution-rapid-refresh",
                artifact_prefix: "noaa_arl_formatted",
                extent: hrrr_domain.ok(),
                hours_per_file: 6,
            },
            Self::HrrrForecast => MeteorologySource {
                model: self,
                artifact_bucket: "high-resolution-rapid-refresh",
                artifact_prefix: "noaa_arl_formatted/forecast",
                extent: hrrr_domain.ok(),
                hours_per_file: 23,
            },
        }
    }
}

/// Naming and layout of one upstream archive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeteorologySource {
    model: MeteorologyModel,
    artifact_bucket: &'static str,
    artifact_prefix: &'static str,
    extent: Option<GridExtent>,
    hours_per_file: u32,
}

impl MeteorologySource {
    pub fn model(&self) -> MeteorologyModel {
        self.model
    }

    /// Bucket holding the archive.
    pub fn artifact_bucket(&self) -> &'static str {
        self.artifact_bucket
    }

    /// Area covered by the archive's parent grid.
    pub fn extent(&self) -> Option<&GridExtent> {
        self.extent.as_ref()
    }

    pub fn hours_per_file(&self) -> u32 {
        self.hours_per_file
    }

    /// Key of the archive file holding `time`.
    pub fn filename_by_time(&self, time: DateTime<Utc>) -> String {
        let hour = floor_to_hour(time);
        match self.model {
            MeteorologyModel::Hrrr => {
                let offset = hour.hour() % self.hours_per_file;
                let first = hour - Duration::hours(i64::from(offset));
                let last = first + Duration::hours(i64::from(self.hours_per_file - 1));
                format!(
                    "{}/{}-{}_hrrr",
                    self.artifact_prefix,
                    first.format("%Y%m%d_%H"),
                    last.format("%H")
                )
            }
            MeteorologyModel::HrrrForecast => format!(
                "{}/{}",
                self.artifact_prefix,
                hour.format("%Y%m%d/hysplit.t%Hz.hrrrf")
            ),
        }
    }

    /// Sorted, de-duplicated keys covering `start..=stop`.
    ///
    /// Forecast files each hold a full forecast, so only one is returned and
    /// ranges longer than a single file are rejected.
    pub fn filenames_by_time_range(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if self.model == MeteorologyModel::HrrrForecast {
            let limit = Duration::hours(i64::from(self.hours_per_file));
            if stop - start > limit {
                return Err(StiltError::MeteorologyRange(format!(
                    "forecast supports ranges up to {} hours, got {} to {}",
                    self.hours_per_file, start, stop
                )));
            }
            return Ok(vec![self.filename_by_time(start)]);
        }

        let mut filenames = Vec::new();
        let mut time = start;
        while time <= stop {
            filenames.push(self.filename_by_time(time));
            time += Duration::hours(1);
        }
        filenames.sort();
        filenames.dedup();
        Ok(filenames)
    }
}

/// Crops and merges archive files down to a space-time extent.
#[async_trait]
pub trait MeteorologyCropper: Send + Sync {
    /// Write the merged crop of `inputs` over `extent` to `output`.
    ///
    /// `levels` limits the vertical levels kept; `None` keeps what each file
    /// declares in its header. Tools still running at `deadline` are killed.
    async fn crop(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        extent: &GridTimeExtent,
        levels: Option<u32>,
        deadline: Deadline,
    ) -> Result<()>;
}

/// Fixed output name of the HYSPLIT extract utilities.
const EXTRACT_BIN: &str = "extract.bin";

/// Byte range of the vertical level count in an ARL record header.
const LEVEL_COUNT_BYTES: std::ops::Range<usize> = 149..152;

/// [`MeteorologyCropper`] backed by HYSPLIT's `xtrct_grid` and
/// `xtrct_time`.
///
/// Each tool runs in its own scratch directory under `work_dir`, removed
/// when the run ends however it ends.
#[derive(Clone, Debug)]
pub struct XtrctCropper {
    xtrct_grid: PathBuf,
    xtrct_time: PathBuf,
    work_dir: PathBuf,
}

fn dir_with_slash(path: &Path) -> String {
    let dir = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    if dir.ends_with('/') {
        dir
    } else {
        format!("{dir}/")
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Last two integers on the final line of `xtrct_time` output.
fn parse_record_range(stdout: &str) -> Option<(i64, i64)> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut numbers = line.split_whitespace().rev();
    let stop = numbers.next()?.parse().ok()?;
    let start = numbers.next()?.parse().ok()?;
    Some((start, stop))
}

async fn read_level_count(path: &Path) -> Result<u32> {
    let mut header = [0u8; LEVEL_COUNT_BYTES.end];
    let mut file = tokio::fs::File::open(path).await?;
    file.read_exact(&mut header).await?;
    let field = header
        .get(LEVEL_COUNT_BYTES)
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.trim().parse().ok());
    field.ok_or_else(|| {
        StiltError::XtrctGrid(format!(
            "{} has no readable level count in its header",
            path.display()
        ))
    })
}

impl XtrctCropper {
    /// Use the utilities in `{stilt_path}/exe`, with scratch space under
    /// `work_dir`.
    pub fn from_stilt_path(stilt_path: &Path, work_dir: impl Into<PathBuf>) -> Self {
        let exe = stilt_path.join("exe");
        Self {
            xtrct_grid: exe.join("xtrct_grid"),
            xtrct_time: exe.join("xtrct_time"),
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn scratch_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.work_dir)?)
    }

    async fn run_tool(spec: ProcessSpec<'_>, deadline: Deadline) -> Result<ProcessOutput> {
        match spec.until(deadline.instant()).run().await {
            Err(StiltError::ProcessTimeout { .. }) => {
                Err(StiltError::DeadlineExceeded(deadline.budget()))
            }
            other => other,
        }
    }

    /// Spatial crop of one file.
    pub async fn xtrct_grid(
        &self,
        input: &Path,
        output: &Path,
        extent: &GridExtent,
        levels: Option<u32>,
        deadline: Deadline,
    ) -> Result<()> {
        let levels = match levels {
            Some(levels) => levels,
            None => read_level_count(input).await?,
        };
        let stdin = [
            dir_with_slash(input),
            file_name(input),
            format!("{} {}", extent.ymin(), extent.xmin()),
            format!("{} {}", extent.ymax(), extent.xmax()),
            levels.to_string(),
            String::new(),
        ]
        .join("\n");

        let workdir = self.scratch_dir("xtrct-grid-").await?;
        debug!(input = %input.display(), "running xtrct_grid");
        let spec = ProcessSpec::new(&self.xtrct_grid)
            .current_dir(workdir.path())
            .stdin(stdin);
        let output_run = Self::run_tool(spec, deadline).await?;
        if !output_run.success() {
            return Err(StiltError::XtrctGrid(output_run.transcript()));
        }
        tokio::fs::copy(workdir.path().join(EXTRACT_BIN), output).await?;
        Ok(())
    }

    /// Temporal crop of one file, run twice to discover record numbers.
    pub async fn xtrct_time(
        &self,
        input: &Path,
        output: &Path,
        tmin: DateTime<Utc>,
        tmax: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<()> {
        let mut stdin = [
            dir_with_slash(input),
            file_name(input),
            tmin.format("%d %H %M").to_string(),
            tmax.format("%d %H %M").to_string(),
            "0".to_string(),
        ]
        .join("\n");

        let workdir = self.scratch_dir("xtrct-time-").await?;
        let spec = ProcessSpec::new(&self.xtrct_time)
            .current_dir(workdir.path())
            .stdin(stdin.clone());
        let locate = Self::run_tool(spec, deadline).await?;
        let (start, stop) = parse_record_range(&locate.stdout).unwrap_or((0, 0));
        if start <= 0 || stop <= 0 {
            return Err(StiltError::XtrctTime(format!(
                "time range not found in {}",
                input.display()
            )));
        }
        stdin.push_str(&format!("\n{start} {stop}\n"));

        let spec = ProcessSpec::new(&self.xtrct_time)
            .current_dir(workdir.path())
            .stdin(stdin);
        let extract = Self::run_tool(spec, deadline).await?;
        if !extract.success() {
            return Err(StiltError::XtrctTime(extract.transcript()));
        }
        tokio::fs::copy(workdir.path().join(EXTRACT_BIN), output).await?;
        Ok(())
    }
}

#[async_trait]
impl MeteorologyCropper for XtrctCropper {
    async fn crop(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        extent: &GridTimeExtent,
        levels: Option<u32>,
        deadline: Deadline,
    ) -> Result<()> {
        let workdir = self.scratch_dir("xtrct-").await?;
        let merged_path = workdir.path().join("merged.arl");
        let mut merged = tokio::fs::File::create(&merged_path).await?;

        for input in inputs {
            let chunk = workdir.path().join(file_name(input));
            self.xtrct_grid(input, &chunk, extent.extent(), levels, deadline)
                .await?;
            merged.write_all(&tokio::fs::read(&chunk).await?).await?;
        }
        merged.flush().await?;
        drop(merged);

        self.xtrct_time(&merged_path, output, extent.tmin(), extent.tmax(), deadline)
            .await?;
        info!(
            files = inputs.len(),
            output = %output.display(),
            "cropped meteorology"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 5, 30, h, m, 0).unwrap()
    }

    #[test]
    fn test_hrrr_filename_groups_six_hours() {
        let source = MeteorologyModel::Hrrr.source();
        assert_eq!(
            source.filename_by_time(at(7, 30)),
            "noaa_arl_formatted/20190530_06-11_hrrr"
        );
        assert_eq!(
            source.filename_by_time(at(0, 0)),
            "noaa_arl_formatted/20190530_00-05_hrrr"
        );
    }

    #[test]
    fn test_hrrr_range_is_sorted_and_deduplicated() {
        let source = MeteorologyModel::Hrrr.source();
        let names = source.filenames_by_time_range(at(4, 0), at(13, 0)).unwrap();
        assert_eq!(
            names,
            vec![
                "noaa_arl_formatted/20190530_00-05_hrrr",
                "noaa_arl_formatted/20190530_06-11_hrrr",
                "noaa_arl_formatted/20190530_12-17_hrrr",
            ]
        );
    }

    #[test]
    fn test_forecast_returns_single_file() {
        let source = MeteorologyModel::HrrrForecast.source();
        let names = source.filenames_by_time_range(at(13, 0), at(20, 0)).unwrap();
        assert_eq!(
            names,
            vec!["noaa_arl_formatted/forecast/20190530/hysplit.t13z.hrrrf"]
        );
    }

    #[test]
    fn test_forecast_rejects_long_ranges() {
        let source = MeteorologyModel::HrrrForecast.source();
        let err = source
            .filenames_by_time_range(at(0, 0), at(0, 0) + Duration::hours(30))
            .unwrap_err();
        assert!(matches!(err, StiltError::MeteorologyRange(_)));
        assert!(err.is_expected());
    }

    #[cfg(unix)]
    fn install_tool(stilt_path: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let exe = stilt_path.join("exe");
        std::fs::create_dir_all(&exe).unwrap();
        let tool = exe.join(name);
        std::fs::write(&tool, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    fn crop_extent() -> GridExtent {
        GridExtent::new(-112.5, -111.5, 40.1, 41.2).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_xtrct_grid_runs_under_work_dir_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), "xtrct_grid", "cat > /dev/null\npwd > extract.bin");
        let work_dir = root.path().join("work");
        let cropper = XtrctCropper::from_stilt_path(root.path(), &work_dir);
        let output = root.path().join("cropped.arl");

        cropper
            .xtrct_grid(
                &root.path().join("input.arl"),
                &output,
                &crop_extent(),
                Some(20),
                Deadline::after(std::time::Duration::from_secs(30)),
            )
            .await
            .unwrap();

        let ran_in = std::fs::read_to_string(&output).unwrap();
        let work_dir = work_dir.canonicalize().unwrap();
        assert!(Path::new(ran_in.trim()).starts_with(&work_dir), "ran in {ran_in}");
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_xtrct_grid_is_killed_at_deadline() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), "xtrct_grid", "touch partial.bin\nsleep 30");
        let work_dir = root.path().join("work");
        let cropper = XtrctCropper::from_stilt_path(root.path(), &work_dir);
        let budget = std::time::Duration::from_millis(300);

        let started = std::time::Instant::now();
        let err = cropper
            .xtrct_grid(
                &root.path().join("input.arl"),
                &root.path().join("cropped.arl"),
                &crop_extent(),
                Some(20),
                Deadline::after(budget),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StiltError::DeadlineExceeded(d) if d == budget));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_model_names() {
        let model: MeteorologyModel = serde_yaml::from_str("hrrr_forecast").unwrap();
        assert_eq!(model, MeteorologyModel::HrrrForecast);
        assert_eq!(serde_json::to_string(&MeteorologyModel::Hrrr).unwrap(), "\"hrrr\"");
    }

    #[test]
    fn test_parse_record_range() {
        let stdout = "reading file\n Start and stop record: 12 340\n\n";
        assert_eq!(parse_record_range(stdout), Some((12, 340)));
        assert_eq!(parse_record_range("nothing here"), None);
    }

    #[test]
    fn test_dir_with_slash() {
        assert_eq!(dir_with_slash(Path::new("/data/met/file.arl")), "/data/met/");
    }
}
