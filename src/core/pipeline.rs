//! Eager batch pipeline over one analysis grid.
//!
//! ```text
//! compose (year, group) jobs   -- parallel
//!   barrier: reference composite
//! harmonize (year) jobs        -- parallel
//!   train on the reference year (fatal on failure)
//! features -> backcast -> post-process (year) chains -- parallel
//! transitions (year pair) jobs
//! ```
//!
//! Per-job results are kept as independent `BackcastResult`s, so a failing
//! year only blocks its own downstream jobs. A failed barrier (no usable
//! reference composite, failed training) is recorded against every job it
//! blocks; artifacts finished before it are still returned.

use crate::config::PipelineConfig;
use crate::core::boundary::AoiMask;
use crate::core::classifier::{ClassifierTrainer, ModelSummary};
use crate::core::compositor::Compositor;
use crate::core::features::{BaselineStats, FeatureBuilder, TopographyLayers};
use crate::core::fusion::Backcaster;
use crate::core::harmonize::{Harmonized, Harmonizer};
use crate::core::postprocess::{PostProcessed, PostProcessor};
use crate::core::prior::{PriorSource, WeightedLabelPrior};
use crate::core::provenance::{Artifact, ArtifactKind, Provenance};
use crate::core::transitions::{analyze_transitions, TransitionReport};
use crate::io::observations::ObservationSource;
use crate::types::{BackcastError, BackcastResult, ClassId, GridSpec, Raster, SensorGroup};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stage selector of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compose,
    Harmonize,
    Classify,
    Transitions,
    All,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::Compose => 0,
            Stage::Harmonize => 1,
            Stage::Classify => 2,
            Stage::Transitions | Stage::All => 3,
        }
    }

    /// True if running `self` also produces the outputs of `other`
    pub fn includes(self, other: Stage) -> bool {
        match (self, other) {
            (Stage::Transitions, Stage::Transitions) => true,
            (Stage::Transitions, _) => false,
            (_, Stage::Transitions) => self == Stage::All,
            _ => self.rank() >= other.rank(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Compose => "compose",
            Stage::Harmonize => "harmonize",
            Stage::Classify => "classify",
            Stage::Transitions => "transitions",
            Stage::All => "all",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Stage {
    type Err = BackcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compose" => Ok(Stage::Compose),
            "harmonize" | "harmonise" => Ok(Stage::Harmonize),
            "classify" => Ok(Stage::Classify),
            "transitions" => Ok(Stage::Transitions),
            "all" => Ok(Stage::All),
            other => Err(BackcastError::Config(format!("Unknown stage: {}", other))),
        }
    }
}

/// Collaborator inputs, all aligned to `grid`
pub struct PipelineInputs<'a> {
    pub grid: &'a GridSpec,
    pub observations: &'a dyn ObservationSource,
    pub topography: &'a TopographyLayers,
    pub reference_labels: &'a Raster<ClassId>,
    /// External prior; when absent the prior is derived from `label_record`
    pub prior: Option<&'a dyn PriorSource>,
    /// Known label maps of other years
    pub label_record: &'a BTreeMap<i32, Raster<ClassId>>,
}

/// Everything a run produced, keyed by job
pub struct PipelineOutputs {
    pub stage: Stage,
    pub composites: BTreeMap<(i32, SensorGroup), BackcastResult<Artifact<Raster<f64>>>>,
    pub harmonized: BTreeMap<i32, BackcastResult<Artifact<Harmonized>>>,
    pub model: Option<ModelSummary>,
    pub classifications: BTreeMap<i32, BackcastResult<Artifact<PostProcessed>>>,
    pub transitions: BTreeMap<(i32, i32), BackcastResult<Artifact<TransitionReport>>>,
}

impl PipelineOutputs {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            composites: BTreeMap::new(),
            harmonized: BTreeMap::new(),
            model: None,
            classifications: BTreeMap::new(),
            transitions: BTreeMap::new(),
        }
    }

    /// Description and exit code of every failed job
    pub fn failures(&self) -> Vec<(String, u8)> {
        fn collect<K: fmt::Debug, T>(
            out: &mut Vec<(String, u8)>,
            what: &str,
            jobs: &BTreeMap<K, BackcastResult<T>>,
        ) {
            for (key, result) in jobs {
                if let Err(e) = result {
                    out.push((format!("{} {:?}: {}", what, key, e), e.exit_code()));
                }
            }
        }
        let mut out = Vec::new();
        collect(&mut out, "compose", &self.composites);
        collect(&mut out, "harmonize", &self.harmonized);
        collect(&mut out, "classify", &self.classifications);
        collect(&mut out, "transitions", &self.transitions);
        out
    }

    /// Highest exit code among failed jobs, 0 if every job succeeded
    pub fn exit_code(&self) -> u8 {
        self.failures().iter().map(|(_, code)| *code).max().unwrap_or(0)
    }
}

/// Run `f` for every key, in parallel when enabled
#[cfg(feature = "parallel")]
fn fork_join<K, T, F>(keys: Vec<K>, f: F) -> BTreeMap<K, BackcastResult<T>>
where
    K: Ord + Copy + Send,
    T: Send,
    F: Fn(K) -> BackcastResult<T> + Sync + Send,
{
    use rayon::prelude::*;

    let results: Vec<(K, BackcastResult<T>)> = keys.into_par_iter().map(|k| (k, f(k))).collect();
    results.into_iter().collect()
}

#[cfg(not(feature = "parallel"))]
fn fork_join<K, T, F>(keys: Vec<K>, f: F) -> BTreeMap<K, BackcastResult<T>>
where
    K: Ord + Copy + Send,
    T: Send,
    F: Fn(K) -> BackcastResult<T> + Sync + Send,
{
    keys.into_iter().map(|k| (k, f(k))).collect()
}

fn blocked<T>(what: &str, year: i32, upstream: &BackcastError) -> BackcastResult<T> {
    Err(BackcastError::Processing(format!(
        "{} {} blocked by upstream failure: {}",
        what, year, upstream
    )))
}

/// Record `cause` against every year a failed barrier keeps from running,
/// keeping the exit class of the cause
fn barrier_failed<T>(
    years: impl IntoIterator<Item = i32>,
    what: &str,
    cause: &BackcastError,
) -> BTreeMap<i32, BackcastResult<T>> {
    log::error!("{} not run: {}", what, cause);
    years
        .into_iter()
        .map(|year| {
            let msg = format!("{} {} not run: {}", what, year, cause);
            let err = match cause {
                BackcastError::Training(_) => BackcastError::Training(msg),
                _ => match cause.exit_code() {
                    1 => BackcastError::Config(msg),
                    2 => BackcastError::Validation(msg),
                    _ => BackcastError::Processing(msg),
                },
            };
            (year, Err(err))
        })
        .collect()
}

/// Pipeline bound to one validated configuration
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> BackcastResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, stage: Stage, inputs: &PipelineInputs<'_>) -> BackcastResult<PipelineOutputs> {
        log::info!("Running stage '{}' on a {}x{} grid", stage, inputs.grid.rows, inputs.grid.cols);
        let mut outputs = PipelineOutputs::new(stage);

        let aoi = self.config.boundary.rasterize(inputs.grid)?;
        if aoi.inside_count() == 0 {
            return Err(BackcastError::Validation(
                "Boundary does not cover any pixel of the analysis grid".to_string(),
            ));
        }

        if stage == Stage::Transitions {
            outputs.transitions = self.transitions(inputs, &aoi, &outputs.classifications);
            return Ok(outputs);
        }

        outputs.composites = self.compose(inputs, &aoi);
        if !stage.includes(Stage::Harmonize) {
            return Ok(outputs);
        }

        let years = self.config.years.keys().copied();
        outputs.harmonized = match self.reference_composite(&outputs.composites) {
            Ok(reference) => self.harmonize(&aoi, reference, &outputs.composites),
            Err(e) => barrier_failed(years, "harmonisation", &e),
        };
        if !stage.includes(Stage::Classify) {
            return Ok(outputs);
        }

        match self.classify(inputs, &outputs.harmonized) {
            Ok((model, classifications)) => {
                outputs.model = Some(model);
                outputs.classifications = classifications;
            }
            Err(e) => outputs.classifications = barrier_failed(self.config.historical_years(), "classification", &e),
        }

        if stage.includes(Stage::Transitions) {
            outputs.transitions = self.transitions(inputs, &aoi, &outputs.classifications);
        }
        Ok(outputs)
    }

    fn compose(
        &self,
        inputs: &PipelineInputs<'_>,
        aoi: &AoiMask,
    ) -> BTreeMap<(i32, SensorGroup), BackcastResult<Artifact<Raster<f64>>>> {
        let compositor = Compositor::new(inputs.grid, aoi, self.config.season);
        let jobs: BTreeMap<(i32, SensorGroup), Vec<_>> = self
            .config
            .compose_jobs()
            .into_iter()
            .map(|(year, group, sensors)| ((year, group), sensors))
            .collect();
        let bounds = self.config.boundary.bounds();

        fork_join(jobs.keys().copied().collect(), |(year, group)| {
            let range = self.config.season.date_range(year)?;
            let mut scenes = Vec::new();
            for sensor in jobs.get(&(year, group)).into_iter().flatten() {
                scenes.extend(inputs.observations.scenes(*sensor, &range, &bounds)?);
            }
            compositor.compose(year, group, &scenes)
        })
    }

    /// Compose barrier: something usable and a non-empty reference composite
    fn reference_composite<'c>(
        &self,
        composites: &'c BTreeMap<(i32, SensorGroup), BackcastResult<Artifact<Raster<f64>>>>,
    ) -> BackcastResult<&'c Artifact<Raster<f64>>> {
        let usable = composites
            .values()
            .any(|r| r.as_ref().map_or(false, |a| !a.data.is_all_nodata()));
        if !usable {
            return Err(BackcastError::Validation(
                "No valid observations for any configured year".to_string(),
            ));
        }

        let year = self.config.reference_year;
        let group = self
            .config
            .primary_group(year)
            .ok_or_else(|| BackcastError::Config(format!("Reference year {} has no sensors", year)))?;
        match composites.get(&(year, group)) {
            Some(Ok(reference)) if reference.data.is_all_nodata() => Err(BackcastError::Validation(format!(
                "Reference composite {} {} has no valid pixels",
                year, group
            ))),
            Some(Ok(reference)) => Ok(reference),
            Some(Err(e)) => Err(BackcastError::Validation(format!(
                "Reference composite {} {} failed: {}",
                year, group, e
            ))),
            None => Err(BackcastError::Processing(format!(
                "Reference composite {} was not produced",
                year
            ))),
        }
    }

    fn harmonize(
        &self,
        aoi: &AoiMask,
        reference: &Artifact<Raster<f64>>,
        composites: &BTreeMap<(i32, SensorGroup), BackcastResult<Artifact<Raster<f64>>>>,
    ) -> BTreeMap<i32, BackcastResult<Artifact<Harmonized>>> {
        let harmonizer = match Harmonizer::new(reference, aoi, self.config.harmonization) {
            Ok(harmonizer) => harmonizer,
            Err(e) => return barrier_failed(self.config.years.keys().copied(), "harmonisation", &e),
        };
        let composite_for = |year: i32| {
            self.config
                .primary_group(year)
                .and_then(|group| composites.get(&(year, group)))
        };

        let years: Vec<i32> = self.config.years.keys().copied().collect();
        fork_join(years, |year| match composite_for(year) {
            Some(Ok(composite)) => harmonizer.harmonize(composite),
            Some(Err(e)) => blocked("harmonisation", year, e),
            None => Err(BackcastError::Processing(format!("No composite for {}", year))),
        })
    }

    #[allow(clippy::type_complexity)]
    fn classify(
        &self,
        inputs: &PipelineInputs<'_>,
        harmonized: &BTreeMap<i32, BackcastResult<Artifact<Harmonized>>>,
    ) -> BackcastResult<(ModelSummary, BTreeMap<i32, BackcastResult<Artifact<PostProcessed>>>)> {
        let reference_year = self.config.reference_year;
        inputs.grid.ensure_same(inputs.topography.grid(), "topography")?;
        inputs.grid.ensure_same(inputs.reference_labels.grid(), "reference labels")?;

        let reference = match harmonized.get(&reference_year) {
            Some(Ok(reference)) => reference,
            Some(Err(e)) => {
                return Err(match e.exit_code() {
                    2 => BackcastError::Validation(format!("Reference year {} not harmonised: {}", reference_year, e)),
                    _ => BackcastError::Processing(format!("Reference year {} not harmonised: {}", reference_year, e)),
                })
            }
            None => return Err(BackcastError::Processing("Reference year was not harmonised".to_string())),
        };

        let baseline = BaselineStats::from_raster(&reference.data.index)?;
        log::info!(
            "Baseline statistics: mean={:.4} std={:.4} over {} pixels",
            baseline.mean,
            baseline.std_dev,
            baseline.valid_pixels
        );
        let builder = FeatureBuilder::new(baseline, inputs.topography);
        let reference_stack = builder.build(&reference.data.index)?;

        let trainer = ClassifierTrainer::new(self.config.classifier.clone(), self.config.n_classes)?;
        let forest = trainer.train(&reference_stack, inputs.reference_labels)?;

        let derived;
        let prior: Option<&dyn PriorSource> = match inputs.prior {
            Some(prior) => Some(prior),
            None => {
                let mut record = inputs.label_record.clone();
                record
                    .entry(reference_year)
                    .or_insert_with(|| inputs.reference_labels.clone());
                derived = WeightedLabelPrior::new(self.config.prior_groups.clone(), record)?;
                Some(&derived)
            }
        };

        let backcaster = Backcaster::new(&forest, prior, self.config.fusion)?;
        let post = PostProcessor::new(self.config.post_process)?;

        let classifications = fork_join(self.config.historical_years(), |year| {
            let input = match harmonized.get(&year) {
                Some(Ok(h)) => h,
                Some(Err(e)) => return blocked("classification", year, e),
                None => return Err(BackcastError::Processing(format!("{} was not harmonised", year))),
            };
            let stack = builder.build(&input.data.index)?;

            let mut provenance = Provenance::for_year(ArtifactKind::Predictors, year)
                .with_source_years(input.provenance.source_years.iter().copied());
            provenance.sensor_group = input.provenance.sensor_group;
            provenance.resolution_m = input.provenance.resolution_m;
            provenance.inherit_warnings(&input.provenance);
            provenance.param("baseline_mean", baseline.mean);
            provenance.param("baseline_std", baseline.std_dev);

            let backcast = backcaster.backcast(year, &Artifact::new(stack, provenance))?;
            post.process(&backcast)
        });

        Ok((forest.summary(), classifications))
    }

    fn transitions(
        &self,
        inputs: &PipelineInputs<'_>,
        aoi: &AoiMask,
        classifications: &BTreeMap<i32, BackcastResult<Artifact<PostProcessed>>>,
    ) -> BTreeMap<(i32, i32), BackcastResult<Artifact<TransitionReport>>> {
        let mut labels: BTreeMap<i32, &Raster<ClassId>> = BTreeMap::new();
        for (year, raster) in inputs.label_record {
            labels.insert(*year, raster);
        }
        labels.insert(self.config.reference_year, inputs.reference_labels);
        for (year, result) in classifications {
            if let Ok(artifact) = result {
                labels.insert(*year, &artifact.data.labels.classes);
            }
        }

        let pairs: Vec<(i32, i32)> = if self.config.transitions.pairs.is_empty() {
            let years: Vec<i32> = labels.keys().copied().collect();
            years.windows(2).map(|w| (w[0], w[1])).collect()
        } else {
            self.config.transitions.pairs.clone()
        };

        fork_join(pairs, |(from, to)| {
            let lookup = |year: i32| {
                labels.get(&year).copied().ok_or_else(|| {
                    BackcastError::Validation(format!("No label map for {} in transition {} -> {}", year, from, to))
                })
            };
            analyze_transitions(
                (from, lookup(from)?),
                (to, lookup(to)?),
                self.config.n_classes,
                &self.config.transitions.rules,
                Some(aoi),
            )
        })
    }
}
