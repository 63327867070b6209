//! Loading collaborator inputs named by the configuration.

use crate::config::{PipelineConfig, SceneEntry};
use crate::core::compositor::{DateRange, Scene};
use crate::core::features::TopographyLayers;
use crate::core::pipeline::PipelineInputs;
use crate::io::observations::ObservationSource;
use crate::io::raster_io;
use crate::types::{BackcastError, BackcastResult, BoundingBox, ClassId, GridSpec, Raster, Sensor};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn require_file(path: &Path, what: &str) -> BackcastResult<()> {
    if path.as_os_str().is_empty() {
        return Err(BackcastError::Config(format!("No {} path configured", what)));
    }
    if !path.is_file() {
        return Err(BackcastError::Config(format!(
            "{} file not found: {}",
            what,
            path.display()
        )));
    }
    Ok(())
}

/// Scene manifest backed by band rasters on disk; scenes are read lazily
pub struct FileObservations {
    entries: Vec<SceneEntry>,
    grid: GridSpec,
}

impl FileObservations {
    /// Parse a JSON manifest and check that every scene names its red and NIR bands
    pub fn from_manifest<P: AsRef<Path>>(path: P, grid: GridSpec) -> BackcastResult<Self> {
        let path = path.as_ref();
        require_file(path, "scene manifest")?;
        let text = std::fs::read_to_string(path)?;
        let mut entries: Vec<SceneEntry> = serde_json::from_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for entry in &mut entries {
            for band in entry.bands.values_mut() {
                *band = resolve(base, band);
            }
        }
        Self::new(entries, grid)
    }

    pub fn new(entries: Vec<SceneEntry>, grid: GridSpec) -> BackcastResult<Self> {
        for entry in &entries {
            entry.red_nir()?;
        }
        log::info!("Scene manifest lists {} acquisitions", entries.len());
        Ok(Self { entries, grid })
    }

    pub fn entries(&self) -> &[SceneEntry] {
        &self.entries
    }

    fn load(&self, entry: &SceneEntry) -> BackcastResult<Scene> {
        let (red_path, nir_path) = entry.red_nir()?;
        let red = raster_io::read_raster(red_path)?;
        let nir = raster_io::read_raster(nir_path)?;
        self.grid.ensure_same(red.grid(), &format!("{} scene {}", entry.sensor, entry.acquired))?;
        Scene::from_reflectance(entry.sensor, entry.acquired, &red, &nir)
    }
}

impl ObservationSource for FileObservations {
    fn scenes(&self, sensor: Sensor, range: &DateRange, bounds: &BoundingBox) -> BackcastResult<Vec<Scene>> {
        if !self.grid.extent().intersects(bounds) {
            return Ok(Vec::new());
        }
        let selected: Vec<&SceneEntry> = self
            .entries
            .iter()
            .filter(|e| e.sensor == sensor && range.contains(&e.acquired))
            .collect();
        log::debug!("{} {}: {} scene(s) in season", sensor, range.year(), selected.len());
        selected.into_iter().map(|e| self.load(e)).collect()
    }
}

/// Everything the pipeline reads from disk, aligned to one grid
pub struct LoadedInputs {
    pub grid: GridSpec,
    pub observations: FileObservations,
    pub topography: TopographyLayers,
    pub reference_labels: Raster<ClassId>,
    pub label_record: BTreeMap<i32, Raster<ClassId>>,
}

impl LoadedInputs {
    /// Load the rasters named in `config.inputs`; the reference labels define the grid
    pub fn load(config: &PipelineConfig) -> BackcastResult<Self> {
        let paths = &config.inputs;
        require_file(&paths.reference_labels, "reference labels")?;
        require_file(&paths.elevation, "elevation")?;
        if let Some(slope) = &paths.slope {
            require_file(slope, "slope")?;
        }
        for (year, path) in &paths.labels {
            require_file(path, &format!("{} labels", year))?;
        }

        let reference_labels = raster_io::read_labels(&paths.reference_labels)?;
        let grid = reference_labels.grid().clone();
        log::info!(
            "Analysis grid: {}x{} at {} m",
            grid.rows,
            grid.cols,
            grid.transform.pixel_width.abs()
        );

        let elevation = raster_io::read_raster(&paths.elevation)?;
        grid.ensure_same(elevation.grid(), "elevation")?;
        let topography = match &paths.slope {
            Some(path) => TopographyLayers::new(elevation, raster_io::read_raster(path)?)?,
            None => {
                log::info!("No slope raster configured, deriving slope from elevation");
                TopographyLayers::from_elevation(elevation, grid.transform.pixel_width.abs())?
            }
        };

        let mut label_record = BTreeMap::new();
        for (year, path) in &paths.labels {
            let labels = raster_io::read_labels(path)?;
            grid.ensure_same(labels.grid(), &format!("{} labels", year))?;
            label_record.insert(*year, labels);
        }

        let observations = FileObservations::from_manifest(&paths.scenes, grid.clone())?;
        Ok(Self {
            grid,
            observations,
            topography,
            reference_labels,
            label_record,
        })
    }

    pub fn as_pipeline_inputs(&self) -> PipelineInputs<'_> {
        PipelineInputs {
            grid: &self.grid,
            observations: &self.observations,
            topography: &self.topography,
            reference_labels: &self.reference_labels,
            prior: None,
            label_record: &self.label_record,
        }
    }
}

/// Resolve a path relative to the manifest directory
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
