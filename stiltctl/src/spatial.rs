//! Geographic grids and space-time extents.
//!
//! Coordinates are decimal degrees. Longitudes live in `[-180, 180)` and
//! latitudes in `(-90, 90)`; every constructor checks ordering and range.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StiltError};

/// Decimal places kept when generating grid coordinates.
pub const COORDINATE_DIGITS: i32 = 8;

/// Largest receptor grid a scene can track; scene counters are stored as
/// 32-bit signed integers.
pub const MAX_GRID_POINTS: u64 = i32::MAX as u64;

/// Round `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Inclusive arithmetic sequence from `start` to `stop` in `step` increments.
///
/// The number of steps is rounded, so `stop` is reached even when the span is
/// not an exact binary multiple of `step`. Each value is rounded to
/// [`COORDINATE_DIGITS`].
pub fn from_to_by(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let steps = sequence_len(start, stop, step).saturating_sub(1);
    (0..=steps)
        .map(|i| round_to(start + step * i as f64, COORDINATE_DIGITS))
        .collect()
}

/// Number of values [`from_to_by`] yields, without allocating them.
///
/// Saturates at `u64::MAX` for spans too fine to count.
pub fn sequence_len(start: f64, stop: f64, step: f64) -> u64 {
    if step.is_nan() || step <= 0.0 || stop < start {
        return 1;
    }
    let steps = ((stop - start) / step).round();
    if steps.is_finite() && steps < u64::MAX as f64 {
        (steps as u64).saturating_add(1)
    } else {
        u64::MAX
    }
}

fn check_longitude(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (-180.0..180.0).contains(&value) {
        Ok(())
    } else {
        Err(StiltError::InvalidConfig(format!(
            "{name}={value} is outside [-180, 180)"
        )))
    }
}

fn check_latitude(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > -90.0 && value < 90.0 {
        Ok(())
    } else {
        Err(StiltError::InvalidConfig(format!(
            "{name}={value} is outside (-90, 90)"
        )))
    }
}

/// A single lon/lat location.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawExtent")]
pub struct GridExtent {
    xmin: f64,
    xmax: f64,
    ymin: f64,
    ymax: f64,
}

#[derive(Deserialize)]
struct RawExtent {
    xmin: f64,
    xmax: f64,
    ymin: f64,
    ymax: f64,
}

impl TryFrom<RawExtent> for GridExtent {
    type Error = StiltError;

    fn try_from(raw: RawExtent) -> Result<Self> {
        Self::new(raw.xmin, raw.xmax, raw.ymin, raw.ymax)
    }
}

impl GridExtent {
    /// Build an extent, rejecting reversed bounds and out-of-range
    /// coordinates.
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Result<Self> {
        check_longitude("xmin", xmin)?;
        check_longitude("xmax", xmax)?;
        check_latitude("ymin", ymin)?;
        check_latitude("ymax", ymax)?;
        if xmin > xmax {
            return Err(StiltError::InvalidConfig(format!(
                "xmin={xmin} exceeds xmax={xmax}"
            )));
        }
        if ymin > ymax {
            return Err(StiltError::InvalidConfig(format!(
                "ymin={ymin} exceeds ymax={ymax}"
            )));
        }
        Ok(Self {
            xmin,
            xmax,
            ymin,
            ymax,
        })
    }

    pub fn xmin(&self) -> f64 {
        self.xmin
    }

    pub fn xmax(&self) -> f64 {
        self.xmax
    }

    pub fn ymin(&self) -> f64 {
        self.ymin
    }

    pub fn ymax(&self) -> f64 {
        self.ymax
    }

    /// True when `other` lies entirely within this extent.
    pub fn contains(&self, other: &GridExtent) -> bool {
        self.xmin <= other.xmin
            && self.xmax >= other.xmax
            && self.ymin <= other.ymin
            && self.ymax >= other.ymax
    }

    /// A copy padded outward by `dx` and `dy` degrees.
    ///
    /// Padding is a magnitude, so a negative pad never shrinks the box.
    /// The result is not clamped to the valid coordinate range.
    pub fn padded(&self, dx: f64, dy: f64) -> GridExtent {
        let (dx, dy) = (dx.abs(), dy.abs());
        GridExtent {
            xmin: self.xmin - dx,
            xmax: self.xmax + dx,
            ymin: self.ymin - dy,
            ymax: self.ymax + dy,
        }
    }
}

/// Grid spacing along each axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridResolution {
    pub xres: f64,
    pub yres: f64,
}

/// A regular receptor grid: an extent plus a resolution.
///
/// Serialized flat (`xmin, xmax, xres, ymin, ymax, yres`) so the document
/// form reads naturally.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid", into = "RawGrid")]
pub struct Grid {
    extent: GridExtent,
    resolution: GridResolution,
}

#[derive(Serialize, Deserialize)]
struct RawGrid {
    xmin: f64,
    xmax: f64,
    xres: f64,
    ymin: f64,
    ymax: f64,
    yres: f64,
}

impl TryFrom<RawGrid> for Grid {
    type Error = StiltError;

    fn try_from(raw: RawGrid) -> Result<Self> {
        let extent = GridExtent::new(raw.xmin, raw.xmax, raw.ymin, raw.ymax)?;
        Self::new(
            extent,
            GridResolution {
                xres: raw.xres,
                yres: raw.yres,
            },
        )
    }
}

impl From<Grid> for RawGrid {
    fn from(grid: Grid) -> Self {
        RawGrid {
            xmin: grid.extent.xmin,
            xmax: grid.extent.xmax,
            xres: grid.resolution.xres,
            ymin: grid.extent.ymin,
            ymax: grid.extent.ymax,
            yres: grid.resolution.yres,
        }
    }
}

impl Grid {
    pub fn new(extent: GridExtent, resolution: GridResolution) -> Result<Self> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(resolution.xres) || !positive(resolution.yres) {
            return Err(StiltError::InvalidConfig(format!(
                "grid resolution must be positive, got xres={} yres={}",
                resolution.xres, resolution.yres
            )));
        }
        let grid = Self { extent, resolution };
        match grid.checked_point_count() {
            Some(count) if count <= MAX_GRID_POINTS => Ok(grid),
            _ => Err(StiltError::InvalidConfig(format!(
                "grid resolution xres={} yres={} yields more than {MAX_GRID_POINTS} points",
                resolution.xres, resolution.yres
            ))),
        }
    }

    fn checked_point_count(&self) -> Option<u64> {
        let nx = sequence_len(self.extent.xmin, self.extent.xmax, self.resolution.xres);
        let ny = sequence_len(self.extent.ymin, self.extent.ymax, self.resolution.yres);
        nx.checked_mul(ny)
    }

    pub fn extent(&self) -> &GridExtent {
        &self.extent
    }

    pub fn resolution(&self) -> &GridResolution {
        &self.resolution
    }

    /// Longitudes of the grid columns, west to east.
    pub fn xs(&self) -> Vec<f64> {
        from_to_by(self.extent.xmin, self.extent.xmax, self.resolution.xres)
    }

    /// Latitudes of the grid rows, south to north.
    pub fn ys(&self) -> Vec<f64> {
        from_to_by(self.extent.ymin, self.extent.ymax, self.resolution.yres)
    }

    /// Every grid point, x-major.
    pub fn points(&self) -> Vec<Point> {
        let ys = self.ys();
        self.xs()
            .into_iter()
            .flat_map(|x| ys.iter().map(move |&y| Point { x, y }))
            .collect()
    }

    /// Number of grid points. Bounded by [`MAX_GRID_POINTS`] at
    /// construction.
    pub fn point_count(&self) -> usize {
        self.checked_point_count()
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(usize::MAX)
    }
}

/// A bounding box paired with an inclusive time window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GridTimeExtent {
    #[serde(flatten)]
    extent: GridExtent,
    tmin: DateTime<Utc>,
    tmax: DateTime<Utc>,
}

impl GridTimeExtent {
    /// Pair `extent` with a time window; the bounds are ordered for you.
    pub fn new(extent: GridExtent, a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        Self {
            extent,
            tmin: a.min(b),
            tmax: a.max(b),
        }
    }

    pub fn extent(&self) -> &GridExtent {
        &self.extent
    }

    pub fn tmin(&self) -> DateTime<Utc> {
        self.tmin
    }

    pub fn tmax(&self) -> DateTime<Utc> {
        self.tmax
    }

    /// Spatial containment only.
    pub fn contains_extent(&self, other: &GridExtent) -> bool {
        self.extent.contains(other)
    }

    /// Spatial and temporal containment.
    pub fn contains(&self, other: &GridTimeExtent) -> bool {
        self.extent.contains(&other.extent)
            && self.tmin <= other.tmin
            && self.tmax >= other.tmax
    }

    /// A padded copy; the receiver is left untouched.
    ///
    /// Each time bound is compared with itself shifted by `dt`, so a
    /// positive `dt` extends `tmax` and a negative one extends `tmin`.
    pub fn expand(&self, dx: f64, dy: f64, dt: Duration) -> GridTimeExtent {
        GridTimeExtent {
            extent: self.extent.padded(dx, dy),
            tmin: self.tmin.min(self.tmin + dt),
            tmax: self.tmax.max(self.tmax + dt),
        }
    }

    /// Replace the time bounds, keeping the spatial extent.
    pub fn with_times(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        Self::new(self.extent, a, b)
    }
}
