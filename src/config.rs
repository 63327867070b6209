//! Pipeline configuration.
//!
//! The configuration is an immutable value loaded once and validated before
//! any processing starts. Every tunable has a default except the year/sensor
//! table and the boundary.

use crate::core::boundary::Boundary;
use crate::core::classifier::ClassifierParams;
use crate::core::compositor::SeasonalWindow;
use crate::core::fusion::FusionParams;
use crate::core::harmonize::HarmonizationParams;
use crate::core::postprocess::PostProcessParams;
use crate::core::prior::PriorGroup;
use crate::core::transitions::ImprobableRule;
use crate::types::{BackcastError, BackcastResult, ClassId, Sensor, SensorGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One acquisition listed in a scene manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEntry {
    pub sensor: Sensor,
    pub acquired: chrono::DateTime<chrono::Utc>,
    /// Band identifier (e.g. "B4") to single-band raster path
    pub bands: BTreeMap<String, PathBuf>,
}

impl SceneEntry {
    /// Paths of the red and near-infrared bands of this sensor
    pub fn red_nir(&self) -> BackcastResult<(&Path, &Path)> {
        let roles = self.sensor.band_roles();
        let find = |band: &str| {
            self.bands.get(band).map(PathBuf::as_path).ok_or_else(|| {
                BackcastError::Config(format!(
                    "Scene {} acquired {} lacks band {}",
                    self.sensor, self.acquired, band
                ))
            })
        };
        Ok((find(roles.red)?, find(roles.nir)?))
    }
}

/// File locations of the collaborator inputs
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    /// Reference-year ground-truth labels; also defines the analysis grid
    pub reference_labels: PathBuf,
    pub elevation: PathBuf,
    /// Precomputed slope in degrees; derived from elevation when absent
    pub slope: Option<PathBuf>,
    /// Scene manifest (JSON list of `SceneEntry`)
    pub scenes: PathBuf,
    /// Label rasters of later years feeding the temporal prior and
    /// transition statistics
    pub labels: BTreeMap<i32, PathBuf>,
}

/// Year pairs for transition statistics and the QC rules applied to them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Pairs to compare; empty means consecutive years of the label record
    pub pairs: Vec<(i32, i32)>,
    pub rules: Vec<ImprobableRule>,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            rules: ImprobableRule::defaults(),
        }
    }
}

fn default_reference_year() -> i32 {
    1990
}

fn default_n_classes() -> ClassId {
    7
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Year with ground-truth labels and the harmonisation target
    #[serde(default = "default_reference_year")]
    pub reference_year: i32,
    /// Sensors whose observations are composited, per year
    pub years: BTreeMap<i32, Vec<Sensor>>,
    pub boundary: Boundary,
    #[serde(default)]
    pub season: SeasonalWindow,
    #[serde(default)]
    pub harmonization: HarmonizationParams,
    #[serde(default)]
    pub classifier: ClassifierParams,
    #[serde(default)]
    pub fusion: FusionParams,
    #[serde(default)]
    pub post_process: PostProcessParams,
    #[serde(default = "PriorGroup::defaults")]
    pub prior_groups: Vec<PriorGroup>,
    #[serde(default)]
    pub transitions: TransitionConfig,
    /// Valid classes are 1..=n_classes
    #[serde(default = "default_n_classes")]
    pub n_classes: ClassId,
    #[serde(default)]
    pub inputs: InputPaths,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but years and boundary
    pub fn new(reference_year: i32, years: BTreeMap<i32, Vec<Sensor>>, boundary: Boundary) -> Self {
        Self {
            reference_year,
            years,
            boundary,
            season: SeasonalWindow::default(),
            harmonization: HarmonizationParams::default(),
            classifier: ClassifierParams::default(),
            fusion: FusionParams::default(),
            post_process: PostProcessParams::default(),
            prior_groups: PriorGroup::defaults(),
            transitions: TransitionConfig::default(),
            n_classes: default_n_classes(),
            inputs: InputPaths::default(),
            output_dir: default_output_dir(),
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> BackcastResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from: {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            BackcastError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject every configuration problem before processing begins
    pub fn validate(&self) -> BackcastResult<()> {
        if self.years.is_empty() {
            return Err(BackcastError::Config("No years configured".to_string()));
        }
        if !self.years.contains_key(&self.reference_year) {
            return Err(BackcastError::Config(format!(
                "Reference year {} has no sensor mapping",
                self.reference_year
            )));
        }
        if self.historical_years().is_empty() {
            return Err(BackcastError::Config("No historical years configured".to_string()));
        }
        for (year, sensors) in &self.years {
            if sensors.is_empty() {
                return Err(BackcastError::Config(format!("Year {} lists no sensors", year)));
            }
            let unique: BTreeSet<_> = sensors.iter().collect();
            if unique.len() != sensors.len() {
                return Err(BackcastError::Config(format!("Year {} lists a sensor twice", year)));
            }
        }
        if self.n_classes == 0 {
            return Err(BackcastError::Config("n_classes must be at least 1".to_string()));
        }

        self.boundary.validate()?;
        self.season.validate()?;
        self.harmonization.validate()?;
        self.classifier.validate()?;
        self.fusion.validate()?;
        self.post_process.validate()?;

        for group in &self.prior_groups {
            if group.years.is_empty() || !(group.weight.is_finite() && group.weight > 0.0) {
                return Err(BackcastError::Config(format!("Invalid prior group {:?}", group)));
            }
        }
        for (from, to) in &self.transitions.pairs {
            if from == to {
                return Err(BackcastError::Config(format!("Transition pair {} -> {} is empty", from, to)));
            }
        }
        log::debug!(
            "Configuration valid: reference {}, historical {:?}",
            self.reference_year,
            self.historical_years()
        );
        Ok(())
    }

    /// Configured years other than the reference year, ascending
    pub fn historical_years(&self) -> Vec<i32> {
        self.years.keys().copied().filter(|&y| y != self.reference_year).collect()
    }

    /// Sensor group whose composite feeds harmonisation for `year`: the
    /// group of the first listed sensor.
    pub fn primary_group(&self, year: i32) -> Option<SensorGroup> {
        self.years.get(&year).and_then(|s| s.first()).map(|s| s.group())
    }

    /// (year, group, sensors) compose jobs; sensors of one group are pooled
    pub fn compose_jobs(&self) -> Vec<(i32, SensorGroup, Vec<Sensor>)> {
        let mut jobs = Vec::new();
        for (&year, sensors) in &self.years {
            let mut by_group: BTreeMap<SensorGroup, Vec<Sensor>> = BTreeMap::new();
            for sensor in sensors {
                by_group.entry(sensor.group()).or_default().push(*sensor);
            }
            jobs.extend(by_group.into_iter().map(|(group, sensors)| (year, group, sensors)));
        }
        jobs
    }
}
