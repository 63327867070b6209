//! Greenest-pixel temporal compositing.
//!
//! Every pixel of a composite holds the maximum NDVI observed within the
//! seasonal window for one sensor group. Equal maxima resolve to the
//! earliest acquisition.

use crate::core::boundary::AoiMask;
use crate::core::provenance::{Artifact, ArtifactKind, Provenance};
use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, GridSpec, Raster, Sensor, SensorGroup};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Clamp an index value into [-1, 1]; non-finite values become nodata.
pub fn clamp_index(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        f64::NAN
    }
}

/// NDVI from red and near-infrared reflectance
pub fn ndvi(red: f64, nir: f64) -> f64 {
    let denom = nir + red;
    if !red.is_finite() || !nir.is_finite() || denom == 0.0 {
        return f64::NAN;
    }
    clamp_index((nir - red) / denom)
}

/// One index observation of one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub acquired: DateTime<Utc>,
    pub index: f64,
}

/// Greenest observation: maximum clamped index, earliest acquisition on ties.
///
/// Nodata observations are ignored; `None` if nothing valid remains.
pub fn greenest(observations: &[Observation]) -> Option<Observation> {
    observations
        .iter()
        .filter(|o| o.index.is_finite())
        .map(|o| Observation {
            acquired: o.acquired,
            index: clamp_index(o.index),
        })
        .fold(None, |best: Option<Observation>, o| match best {
            None => Some(o),
            Some(b) if o.index > b.index || (o.index == b.index && o.acquired < b.acquired) => Some(o),
            keep => keep,
        })
}

/// A single acquisition: one index value per pixel
#[derive(Debug, Clone)]
pub struct Scene {
    pub sensor: Sensor,
    pub acquired: DateTime<Utc>,
    index: Raster<f64>,
}

impl Scene {
    /// Wrap a precomputed index raster, clamping every value into [-1, 1]
    pub fn from_index(sensor: Sensor, acquired: DateTime<Utc>, index: Raster<f64>) -> BackcastResult<Self> {
        let grid = index.grid().clone();
        let clamped = index.into_data().mapv(clamp_index);
        Ok(Self {
            sensor,
            acquired,
            index: Raster::from_array(grid, clamped)?,
        })
    }

    /// Compute NDVI from the sensor's red and NIR reflectance bands
    pub fn from_reflectance(
        sensor: Sensor,
        acquired: DateTime<Utc>,
        red: &Raster<f64>,
        nir: &Raster<f64>,
    ) -> BackcastResult<Self> {
        red.grid().ensure_same(nir.grid(), "NIR band")?;
        let mut index = red.data().clone();
        index.zip_mut_with(nir.data(), |r, &n| *r = ndvi(*r, n));
        Ok(Self {
            sensor,
            acquired,
            index: Raster::from_array(red.grid().clone(), index)?,
        })
    }

    pub fn index(&self) -> &Raster<f64> {
        &self.index
    }

    pub fn observation(&self, row: usize, col: usize) -> Observation {
        Observation {
            acquired: self.acquired,
            index: self.index.get(row, col),
        }
    }
}

/// Month and day, written "MM-DD"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> BackcastResult<Self> {
        // 2000 is a leap year, so 02-29 is accepted here
        if NaiveDate::from_ymd_opt(2000, month, day).is_none() {
            return Err(BackcastError::Config(format!("Invalid month/day: {:02}-{:02}", month, day)));
        }
        Ok(Self { month, day })
    }

    /// The date in `year`, with 02-29 falling back to 02-28 outside leap years
    pub fn in_year(&self, year: i32) -> BackcastResult<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
            .or_else(|| NaiveDate::from_ymd_opt(year, self.month, self.day - 1))
            .ok_or_else(|| BackcastError::Config(format!("Invalid date {}-{}", year, self)))
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

impl FromStr for MonthDay {
    type Err = BackcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (m, d) = s
            .split_once('-')
            .ok_or_else(|| BackcastError::Config(format!("Expected MM-DD, got '{}'", s)))?;
        let month = m
            .trim()
            .parse()
            .map_err(|_| BackcastError::Config(format!("Invalid month in '{}'", s)))?;
        let day = d
            .trim()
            .parse()
            .map_err(|_| BackcastError::Config(format!("Invalid day in '{}'", s)))?;
        MonthDay::new(month, day)
    }
}

impl TryFrom<String> for MonthDay {
    type Error = BackcastError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthDay> for String {
    fn from(md: MonthDay) -> Self {
        md.to_string()
    }
}

/// Seasonal compositing window, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalWindow {
    pub start: MonthDay,
    pub end: MonthDay,
}

impl Default for SeasonalWindow {
    fn default() -> Self {
        Self {
            start: MonthDay { month: 6, day: 1 },
            end: MonthDay { month: 9, day: 30 },
        }
    }
}

impl SeasonalWindow {
    pub fn validate(&self) -> BackcastResult<()> {
        MonthDay::new(self.start.month, self.start.day)?;
        MonthDay::new(self.end.month, self.end.day)?;
        if self.start > self.end {
            return Err(BackcastError::Config(format!(
                "Seasonal window start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn date_range(&self, year: i32) -> BackcastResult<DateRange> {
        Ok(DateRange {
            start: self.start.in_year(year)?,
            end: self.end.in_year(year)?,
        })
    }
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, when: &DateTime<Utc>) -> bool {
        let date = when.date_naive();
        date >= self.start && date <= self.end
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }
}

/// Greenest-pixel compositor for one grid and AOI
pub struct Compositor<'a> {
    grid: &'a GridSpec,
    aoi: &'a AoiMask,
    window: SeasonalWindow,
    executor: TileExecutor,
}

impl<'a> Compositor<'a> {
    pub fn new(grid: &'a GridSpec, aoi: &'a AoiMask, window: SeasonalWindow) -> Self {
        Self {
            grid,
            aoi,
            window,
            executor: TileExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: TileExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Build the composite of `group` for `year` from the scenes supplied.
    ///
    /// Scenes of other groups or outside the seasonal window are ignored.
    /// No usable scene yields an all-nodata composite with a warning.
    pub fn compose(&self, year: i32, group: SensorGroup, scenes: &[Scene]) -> BackcastResult<Artifact<Raster<f64>>> {
        self.grid.ensure_same(self.aoi.grid(), "AOI mask")?;
        let range = self.window.date_range(year)?;

        let mut pooled: Vec<&Scene> = scenes
            .iter()
            .filter(|s| s.sensor.group() == group && range.contains(&s.acquired))
            .collect();
        for scene in &pooled {
            self.grid
                .ensure_same(scene.index().grid(), &format!("{} scene {}", scene.sensor, scene.acquired))?;
        }
        // Observation order is acquisition order
        pooled.sort_by(|a, b| a.acquired.cmp(&b.acquired).then(a.sensor.cmp(&b.sensor)));

        log::info!(
            "Compositing {} {} from {} scenes ({} to {})",
            year,
            group,
            pooled.len(),
            range.start,
            range.end
        );

        let mut provenance = Provenance::for_year(ArtifactKind::Composite, year)
            .with_sensor_group(group)
            .with_source_years([year]);
        provenance.param("window_start", self.window.start.to_string());
        provenance.param("window_end", self.window.end.to_string());
        provenance.param("scene_count", pooled.len());
        provenance.param("tie_policy", "earliest_acquisition");
        let mut sensors: Vec<&str> = pooled.iter().map(|s| s.sensor.tag()).collect();
        sensors.sort_unstable();
        sensors.dedup();
        provenance.param("sensors", sensors);

        if pooled.is_empty() {
            provenance.warn(format!("No {} observations in the seasonal window", group));
            return Ok(Artifact::new(Raster::nodata(self.grid.clone()), provenance));
        }

        let aoi = self.aoi;
        let data = self.executor.map_cells(self.grid.shape(), |row, col| {
            if !aoi.contains(row, col) {
                return f64::NAN;
            }
            let observations: Vec<Observation> = pooled.iter().map(|s| s.observation(row, col)).collect();
            greenest(&observations).map_or(f64::NAN, |o| o.index)
        })?;
        let composite = Raster::from_array(self.grid.clone(), data)?;

        if composite.is_all_nodata() {
            provenance.warn(format!("{} composite has no valid pixels inside the boundary", group));
        }
        log::debug!("{} {} composite: {} valid pixels", year, group, composite.valid_count());

        Ok(Artifact::new(composite, provenance))
    }
}
