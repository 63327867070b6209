use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Land-cover class identifier. Valid classes are `1..=n_classes`, 0 is nodata.
pub type ClassId = u8;

/// Nodata marker for class rasters
pub const NO_CLASS: ClassId = 0;

/// Geospatial bounding box in grid CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            top_left_x: coeffs[0],
            pixel_width: coeffs[1],
            rotation_x: coeffs[2],
            top_left_y: coeffs[3],
            rotation_y: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Coordinates of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }
}

/// Grid geometry shared by every raster taking part in a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub rows: usize,
    pub cols: usize,
    pub transform: GeoTransform,
    /// CRS identifier, e.g. "EPSG:4326" or a WKT string
    pub crs: String,
}

impl GridSpec {
    pub fn new(rows: usize, cols: usize, transform: GeoTransform, crs: impl Into<String>) -> Self {
        Self {
            rows,
            cols,
            transform,
            crs: crs.into(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent covered by the grid, derived from the corner pixel centres
    pub fn extent(&self) -> BoundingBox {
        let t = &self.transform;
        let corners = [
            (t.top_left_x, t.top_left_y),
            (
                t.top_left_x + self.cols as f64 * t.pixel_width,
                t.top_left_y + self.cols as f64 * t.rotation_y,
            ),
            (
                t.top_left_x + self.rows as f64 * t.rotation_x,
                t.top_left_y + self.rows as f64 * t.pixel_height,
            ),
            (
                t.top_left_x + self.cols as f64 * t.pixel_width + self.rows as f64 * t.rotation_x,
                t.top_left_y + self.cols as f64 * t.rotation_y + self.rows as f64 * t.pixel_height,
            ),
        ];
        let mut bbox = BoundingBox {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.max_x = bbox.max_x.max(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }

    /// Fail with `GridMismatch` unless `other` has identical geometry.
    pub fn ensure_same(&self, other: &GridSpec, what: &str) -> BackcastResult<()> {
        if self == other {
            Ok(())
        } else {
            Err(BackcastError::GridMismatch {
                what: what.to_string(),
                expected: format!("{}x{} {:?} {}", self.rows, self.cols, self.transform, self.crs),
                actual: format!("{}x{} {:?} {}", other.rows, other.cols, other.transform, other.crs),
            })
        }
    }
}

/// Cell types that carry their own nodata marker
pub trait RasterValue: Copy + Send + Sync + PartialEq + fmt::Debug + 'static {
    const NODATA: Self;

    fn is_nodata(self) -> bool;

    fn is_valid(self) -> bool {
        !self.is_nodata()
    }
}

impl RasterValue for f64 {
    const NODATA: Self = f64::NAN;

    fn is_nodata(self) -> bool {
        !self.is_finite()
    }
}

impl RasterValue for ClassId {
    const NODATA: Self = NO_CLASS;

    fn is_nodata(self) -> bool {
        self == NO_CLASS
    }
}

/// Single-band raster on a fixed grid
#[derive(Debug, Clone)]
pub struct Raster<T: RasterValue> {
    grid: GridSpec,
    data: Array2<T>,
}

impl<T: RasterValue> Raster<T> {
    pub fn from_array(grid: GridSpec, data: Array2<T>) -> BackcastResult<Self> {
        if data.dim() != grid.shape() {
            return Err(BackcastError::Validation(format!(
                "array shape {:?} does not match grid shape {:?}",
                data.dim(),
                grid.shape()
            )));
        }
        Ok(Self { grid, data })
    }

    pub fn filled(grid: GridSpec, value: T) -> Self {
        let data = Array2::from_elem(grid.shape(), value);
        Self { grid, data }
    }

    pub fn nodata(grid: GridSpec) -> Self {
        Self::filled(grid, T::NODATA)
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn into_data(self) -> Array2<T> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[[row, col]]
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_valid()).count()
    }

    pub fn is_all_nodata(&self) -> bool {
        self.data.iter().all(|v| v.is_nodata())
    }
}

/// Landsat sensors accepted as observation sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sensor {
    Landsat1Mss,
    Landsat2Mss,
    Landsat3Mss,
    Landsat4Mss,
    Landsat5Mss,
    Landsat4Tm,
    Landsat5Tm,
    Landsat7Etm,
    Landsat8Oli,
}

/// Sensors of one generation whose observations are pooled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorGroup {
    Mss,
    Tm,
    Etm,
    Oli,
}

/// Band identifiers for the red and near-infrared roles of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandRoles {
    pub red: &'static str,
    pub nir: &'static str,
}

impl Sensor {
    pub const ALL: [Sensor; 9] = [
        Sensor::Landsat1Mss,
        Sensor::Landsat2Mss,
        Sensor::Landsat3Mss,
        Sensor::Landsat4Mss,
        Sensor::Landsat5Mss,
        Sensor::Landsat4Tm,
        Sensor::Landsat5Tm,
        Sensor::Landsat7Etm,
        Sensor::Landsat8Oli,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Sensor::Landsat1Mss => "LM01",
            Sensor::Landsat2Mss => "LM02",
            Sensor::Landsat3Mss => "LM03",
            Sensor::Landsat4Mss => "LM04",
            Sensor::Landsat5Mss => "LM05",
            Sensor::Landsat4Tm => "LT04",
            Sensor::Landsat5Tm => "LT05",
            Sensor::Landsat7Etm => "LE07",
            Sensor::Landsat8Oli => "LC08",
        }
    }

    pub fn group(self) -> SensorGroup {
        match self {
            Sensor::Landsat1Mss
            | Sensor::Landsat2Mss
            | Sensor::Landsat3Mss
            | Sensor::Landsat4Mss
            | Sensor::Landsat5Mss => SensorGroup::Mss,
            Sensor::Landsat4Tm | Sensor::Landsat5Tm => SensorGroup::Tm,
            Sensor::Landsat7Etm => SensorGroup::Etm,
            Sensor::Landsat8Oli => SensorGroup::Oli,
        }
    }

    pub fn band_roles(self) -> BandRoles {
        match self {
            // Landsat 1-3 MSS numbers its bands 4-7
            Sensor::Landsat1Mss | Sensor::Landsat2Mss | Sensor::Landsat3Mss => {
                BandRoles { red: "B5", nir: "B6" }
            }
            Sensor::Landsat4Mss | Sensor::Landsat5Mss => BandRoles { red: "B2", nir: "B3" },
            Sensor::Landsat4Tm | Sensor::Landsat5Tm | Sensor::Landsat7Etm => {
                BandRoles { red: "B3", nir: "B4" }
            }
            Sensor::Landsat8Oli => BandRoles { red: "B4", nir: "B5" },
        }
    }
}

impl SensorGroup {
    /// Nominal output resolution in metres
    pub fn resolution_m(self) -> f64 {
        match self {
            SensorGroup::Mss => 60.0,
            SensorGroup::Tm | SensorGroup::Etm | SensorGroup::Oli => 30.0,
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl fmt::Display for SensorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorGroup::Mss => write!(f, "mss"),
            SensorGroup::Tm => write!(f, "tm"),
            SensorGroup::Etm => write!(f, "etm"),
            SensorGroup::Oli => write!(f, "oli"),
        }
    }
}

impl FromStr for Sensor {
    type Err = BackcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        Sensor::ALL
            .iter()
            .copied()
            .find(|sensor| sensor.tag() == wanted)
            .ok_or_else(|| BackcastError::Config(format!("Unknown sensor tag: {}", s)))
    }
}

impl TryFrom<String> for Sensor {
    type Error = BackcastError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Sensor> for String {
    fn from(sensor: Sensor) -> Self {
        sensor.tag().to_string()
    }
}

/// Per-pixel class probabilities, laid out as (class, row, col).
///
/// Pixels without a valid predictor hold NaN in every class band.
#[derive(Debug, Clone)]
pub struct ClassProbabilities {
    grid: GridSpec,
    classes: Vec<ClassId>,
    data: Array3<f64>,
}

impl ClassProbabilities {
    pub fn from_array(grid: GridSpec, classes: Vec<ClassId>, data: Array3<f64>) -> BackcastResult<Self> {
        if data.dim() != (classes.len(), grid.rows, grid.cols) {
            return Err(BackcastError::Validation(format!(
                "probability cube {:?} does not match {} classes on a {}x{} grid",
                data.dim(),
                classes.len(),
                grid.rows,
                grid.cols
            )));
        }
        if classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BackcastError::Validation(
                "probability classes must be strictly ascending".to_string(),
            ));
        }
        Ok(Self { grid, classes, data })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Probability vector of one pixel, `None` if the pixel is invalid
    pub fn pixel(&self, row: usize, col: usize) -> Option<Vec<f64>> {
        let values: Vec<f64> = self.data.slice(ndarray::s![.., row, col]).to_vec();
        if values.iter().all(|p| p.is_finite()) {
            Some(values)
        } else {
            None
        }
    }

    /// Probability of one class at a pixel (0 if the class is unknown here)
    pub fn probability(&self, class: ClassId, row: usize, col: usize) -> f64 {
        match self.classes.binary_search(&class) {
            Ok(k) => self.data[[k, row, col]],
            Err(_) => 0.0,
        }
    }

    /// Re-express the cube over `classes`; classes absent here get probability 0.
    pub fn align_to(&self, classes: &[ClassId]) -> BackcastResult<ClassProbabilities> {
        let (rows, cols) = self.grid.shape();
        let mut data = Array3::<f64>::zeros((classes.len(), rows, cols));
        let valid = self.valid_mask();
        for (k, class) in classes.iter().enumerate() {
            let mut band = data.index_axis_mut(Axis(0), k);
            match self.classes.binary_search(class) {
                Ok(src) => band.assign(&self.data.index_axis(Axis(0), src)),
                Err(_) => band.zip_mut_with(&valid, |p, &ok| {
                    *p = if ok { 0.0 } else { f64::NAN };
                }),
            }
        }
        ClassProbabilities::from_array(self.grid.clone(), classes.to_vec(), data)
    }

    /// True where every class band is finite
    pub fn valid_mask(&self) -> Array2<bool> {
        let (rows, cols) = self.grid.shape();
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            self.data.slice(ndarray::s![.., r, c]).iter().all(|p| p.is_finite())
        })
    }
}

/// Error types for back-casting
#[derive(Debug, thiserror::Error)]
pub enum BackcastError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data validation error: {0}")]
    Validation(String),

    #[error("Grid mismatch for {what}: expected {expected}, got {actual}")]
    GridMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Training error: {0}")]
    Training(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl BackcastError {
    /// Process exit code of the command surface (0 is success)
    pub fn exit_code(&self) -> u8 {
        match self {
            BackcastError::Config(_) | BackcastError::Json(_) => 1,
            BackcastError::Validation(_) | BackcastError::GridMismatch { .. } => 2,
            BackcastError::Io(_)
            | BackcastError::Csv(_)
            | BackcastError::Training(_)
            | BackcastError::Processing(_) => 3,
            #[cfg(feature = "gdal")]
            BackcastError::Gdal(_) => 2,
        }
    }
}

/// Result type for back-casting operations
pub type BackcastResult<T> = Result<T, BackcastError>;
