//! Predictor stack assembly.
//!
//! Band order is fixed: harmonised NDVI, NDVI anomaly against the reference
//! year, elevation, slope, normalised latitude, normalised longitude.

use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, GridSpec, Raster, RasterValue};
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

/// Names of the predictor bands, in stack order
pub const PREDICTOR_BANDS: [&str; 6] = ["ndvi", "ndvi_z", "elev", "slope", "lat", "lon"];

/// Number of predictor bands
pub const N_PREDICTORS: usize = PREDICTOR_BANDS.len();

/// Mean and standard deviation of the reference-year index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub valid_pixels: usize,
}

impl BaselineStats {
    /// Population statistics over valid pixels
    pub fn from_raster(index: &Raster<f64>) -> BackcastResult<Self> {
        let values: Vec<f64> = index.data().iter().copied().filter(|v| v.is_valid()).collect();
        if values.is_empty() {
            return Err(BackcastError::Validation(
                "Reference index has no valid pixels, baseline statistics undefined".to_string(),
            ));
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Ok(Self {
            mean,
            std_dev: variance.sqrt(),
            valid_pixels: values.len(),
        })
    }

    /// Z-score of `value`; 0 when the baseline has no spread
    pub fn anomaly(&self, value: f64) -> f64 {
        if value.is_nodata() {
            return f64::NAN;
        }
        if self.std_dev == 0.0 || !self.std_dev.is_finite() {
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }
}

/// Static covariates aligned to the analysis grid
#[derive(Debug, Clone)]
pub struct TopographyLayers {
    pub elevation: Raster<f64>,
    pub slope: Raster<f64>,
    pub latitude: Raster<f64>,
    pub longitude: Raster<f64>,
}

impl TopographyLayers {
    /// Use precomputed elevation and slope; coordinates come from the grid.
    pub fn new(elevation: Raster<f64>, slope: Raster<f64>) -> BackcastResult<Self> {
        elevation.grid().ensure_same(slope.grid(), "slope")?;
        let (latitude, longitude) = normalized_coordinates(elevation.grid())?;
        Ok(Self {
            elevation,
            slope,
            latitude,
            longitude,
        })
    }

    /// Derive slope (degrees) from elevation with central differences
    pub fn from_elevation(elevation: Raster<f64>, pixel_size_m: f64) -> BackcastResult<Self> {
        let slope = slope_degrees(&elevation, pixel_size_m)?;
        Self::new(elevation, slope)
    }

    pub fn grid(&self) -> &GridSpec {
        self.elevation.grid()
    }
}

/// Slope in degrees. Border pixels copy their nearest interior neighbour;
/// a nodata pixel in the stencil makes the slope nodata.
pub fn slope_degrees(dem: &Raster<f64>, pixel_size_m: f64) -> BackcastResult<Raster<f64>> {
    if !(pixel_size_m.is_finite() && pixel_size_m > 0.0) {
        return Err(BackcastError::Config(format!("Invalid DEM pixel size: {}", pixel_size_m)));
    }
    let (rows, cols) = dem.grid().shape();
    if rows < 3 || cols < 3 {
        return Err(BackcastError::Validation(format!(
            "DEM {}x{} is too small for slope computation",
            rows, cols
        )));
    }
    let z = dem.data();
    let data = TileExecutor::default().map_cells((rows, cols), |row, col| {
        let i = row.clamp(1, rows - 2);
        let j = col.clamp(1, cols - 2);
        let (east, west, south, north) = (z[[i, j + 1]], z[[i, j - 1]], z[[i + 1, j]], z[[i - 1, j]]);
        if [east, west, south, north].iter().any(|v| v.is_nodata()) {
            return f64::NAN;
        }
        let dz_dx = (east - west) / (2.0 * pixel_size_m);
        let dz_dy = (south - north) / (2.0 * pixel_size_m);
        (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees()
    })?;
    Raster::from_array(dem.grid().clone(), data)
}

/// Pixel-centre y and x, min-max scaled to [0, 1] over the grid
pub fn normalized_coordinates(grid: &GridSpec) -> BackcastResult<(Raster<f64>, Raster<f64>)> {
    let extent = grid.extent();
    let half_x = grid.transform.pixel_width.abs() / 2.0;
    let half_y = grid.transform.pixel_height.abs() / 2.0;
    let (min_x, max_x) = (extent.min_x + half_x, extent.max_x - half_x);
    let (min_y, max_y) = (extent.min_y + half_y, extent.max_y - half_y);
    let scale = |v: f64, lo: f64, hi: f64| {
        if hi - lo > 0.0 {
            ((v - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.5
        }
    };
    let lat = Array2::from_shape_fn(grid.shape(), |(r, c)| {
        let (_, y) = grid.transform.pixel_center(r, c);
        scale(y, min_y, max_y)
    });
    let lon = Array2::from_shape_fn(grid.shape(), |(r, c)| {
        let (x, _) = grid.transform.pixel_center(r, c);
        scale(x, min_x, max_x)
    });
    Ok((
        Raster::from_array(grid.clone(), lat)?,
        Raster::from_array(grid.clone(), lon)?,
    ))
}

/// Per-pixel predictor vectors, laid out as (band, row, col)
#[derive(Debug, Clone)]
pub struct PredictorStack {
    grid: GridSpec,
    bands: Array3<f64>,
}

impl PredictorStack {
    pub fn from_bands(grid: GridSpec, bands: Array3<f64>) -> BackcastResult<Self> {
        if bands.dim() != (N_PREDICTORS, grid.rows, grid.cols) {
            return Err(BackcastError::Validation(format!(
                "predictor stack {:?} does not match {} bands on a {}x{} grid",
                bands.dim(),
                N_PREDICTORS,
                grid.rows,
                grid.cols
            )));
        }
        Ok(Self { grid, bands })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn bands(&self) -> &Array3<f64> {
        &self.bands
    }

    pub fn band(&self, name: &str) -> Option<ndarray::ArrayView2<'_, f64>> {
        PREDICTOR_BANDS
            .iter()
            .position(|b| *b == name)
            .map(|k| self.bands.index_axis(Axis(0), k))
    }

    /// Predictor vector of a pixel, `None` if any band is nodata
    pub fn pixel(&self, row: usize, col: usize) -> Option<[f64; N_PREDICTORS]> {
        let mut out = [0.0; N_PREDICTORS];
        for (k, v) in self.bands.slice(s![.., row, col]).iter().enumerate() {
            if v.is_nodata() {
                return None;
            }
            out[k] = *v;
        }
        Some(out)
    }

    pub fn valid_count(&self) -> usize {
        let (rows, cols) = self.grid.shape();
        (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .filter(|&(r, c)| self.pixel(r, c).is_some())
            .count()
    }
}

/// Builds predictor stacks against fixed reference-year statistics
pub struct FeatureBuilder<'a> {
    baseline: BaselineStats,
    topography: &'a TopographyLayers,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(baseline: BaselineStats, topography: &'a TopographyLayers) -> Self {
        Self { baseline, topography }
    }

    pub fn baseline(&self) -> &BaselineStats {
        &self.baseline
    }

    pub fn build(&self, index: &Raster<f64>) -> BackcastResult<PredictorStack> {
        let grid = self.topography.grid();
        grid.ensure_same(index.grid(), "harmonised index")?;
        grid.ensure_same(self.topography.slope.grid(), "slope")?;
        grid.ensure_same(self.topography.latitude.grid(), "latitude")?;
        grid.ensure_same(self.topography.longitude.grid(), "longitude")?;

        let (rows, cols) = grid.shape();
        let mut bands = Array3::<f64>::from_elem((N_PREDICTORS, rows, cols), f64::NAN);
        bands.index_axis_mut(Axis(0), 0).assign(index.data());
        bands
            .index_axis_mut(Axis(0), 1)
            .assign(&index.data().mapv(|v| self.baseline.anomaly(v)));
        bands.index_axis_mut(Axis(0), 2).assign(self.topography.elevation.data());
        bands.index_axis_mut(Axis(0), 3).assign(self.topography.slope.data());
        bands.index_axis_mut(Axis(0), 4).assign(self.topography.latitude.data());
        bands.index_axis_mut(Axis(0), 5).assign(self.topography.longitude.data());

        // A nodata band invalidates the whole pixel
        for r in 0..rows {
            for c in 0..cols {
                let mut lane = bands.slice_mut(s![.., r, c]);
                if lane.iter().any(|v| v.is_nodata()) {
                    lane.fill(f64::NAN);
                }
            }
        }

        let stack = PredictorStack::from_bands(grid.clone(), bands)?;
        log::debug!("Predictor stack: {} of {} pixels valid", stack.valid_count(), grid.len());
        Ok(stack)
    }
}
