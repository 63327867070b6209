//! Back-casting: classifier probabilities fused with a temporal prior.
//!
//! Linear rule: `P = a * P_rf + (1 - a) * P_prior`.
//! Reinforcement rule: `P = P_rf * (a + (1 - a) * P_prior)`.
//! Both are renormalised to sum to one. A pixel without a prior keeps
//! `P_rf`, and the winning class is the argmax with ties going to the
//! lowest class id.

use crate::core::classifier::ProbabilisticClassifier;
use crate::core::features::PredictorStack;
use crate::core::prior::PriorSource;
use crate::core::provenance::{Artifact, ArtifactKind, Provenance};
use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, ClassId, ClassProbabilities, Raster, NO_CLASS};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How classifier and prior probabilities are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionRule {
    #[default]
    Linear,
    Reinforcement,
}

impl fmt::Display for FusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionRule::Linear => write!(f, "linear"),
            FusionRule::Reinforcement => write!(f, "reinforcement"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Weight of the classifier output, in [0, 1]
    pub prior_alpha: f64,
    pub rule: FusionRule,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            prior_alpha: 0.7,
            rule: FusionRule::Linear,
        }
    }
}

impl FusionParams {
    pub fn validate(&self) -> BackcastResult<()> {
        if !(0.0..=1.0).contains(&self.prior_alpha) {
            return Err(BackcastError::Config(format!(
                "prior_alpha must lie in [0, 1], got {}",
                self.prior_alpha
            )));
        }
        Ok(())
    }
}

fn normalized(mut probs: Vec<f64>) -> Option<Vec<f64>> {
    let sum: f64 = probs.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return None;
    }
    probs.iter_mut().for_each(|p| *p /= sum);
    Some(probs)
}

/// Fuse one pixel. A missing or non-finite prior, or a fused vector with no
/// mass, leaves the classifier distribution in place.
pub fn fuse_pixel(rule: FusionRule, alpha: f64, rf: &[f64], prior: Option<&[f64]>) -> Vec<f64> {
    let fused = prior
        .filter(|p| p.len() == rf.len() && p.iter().all(|v| v.is_finite() && *v >= 0.0))
        .and_then(|prior| {
            let combined = rf
                .iter()
                .zip(prior)
                .map(|(&r, &p)| match rule {
                    FusionRule::Linear => alpha * r + (1.0 - alpha) * p,
                    FusionRule::Reinforcement => r * (alpha + (1.0 - alpha) * p),
                })
                .collect();
            normalized(combined)
        });
    match fused {
        Some(p) => p,
        None => normalized(rf.to_vec()).unwrap_or_else(|| rf.to_vec()),
    }
}

/// Winning class and its probability; ties go to the lowest class id
pub fn argmax(classes: &[ClassId], probs: &[f64]) -> Option<(ClassId, f64)> {
    let mut best: Option<(ClassId, f64)> = None;
    for (&class, &p) in classes.iter().zip(probs) {
        if !p.is_finite() {
            return None;
        }
        if best.map_or(true, |(_, bp)| p > bp) {
            best = Some((class, p));
        }
    }
    best
}

/// Final class per pixel and the winning fused probability
#[derive(Debug, Clone)]
pub struct LabelMap {
    pub classes: Raster<ClassId>,
    pub confidence: Raster<f64>,
}

/// Labels together with the fused probabilities they were drawn from
#[derive(Debug, Clone)]
pub struct Backcast {
    pub labels: LabelMap,
    pub probabilities: ClassProbabilities,
}

struct FusedPixel {
    probs: Option<Vec<f64>>,
    prior_used: bool,
}

/// Applies a trained model to historical predictor stacks
pub struct Backcaster<'a> {
    model: &'a dyn ProbabilisticClassifier,
    prior: Option<&'a dyn PriorSource>,
    params: FusionParams,
    executor: TileExecutor,
}

impl<'a> Backcaster<'a> {
    pub fn new(
        model: &'a dyn ProbabilisticClassifier,
        prior: Option<&'a dyn PriorSource>,
        params: FusionParams,
    ) -> BackcastResult<Self> {
        params.validate()?;
        Ok(Self {
            model,
            prior,
            params,
            executor: TileExecutor::default(),
        })
    }

    pub fn backcast(&self, year: i32, stack: &Artifact<PredictorStack>) -> BackcastResult<Artifact<Backcast>> {
        let grid = stack.data.grid();
        let classes = self.model.classes();
        let rf = self.model.predict_proba(&stack.data)?;

        let mut provenance = Provenance::for_year(ArtifactKind::Classification, year)
            .with_source_years(stack.provenance.source_years.iter().copied().chain([year]))
            .with_model_version(self.model.model_version());
        provenance.sensor_group = stack.provenance.sensor_group;
        provenance.resolution_m = stack.provenance.resolution_m;
        provenance.inherit_warnings(&stack.provenance);
        provenance.param("prior_alpha", self.params.prior_alpha);
        provenance.param("fusion_rule", self.params.rule.to_string());

        let prior = match self.prior {
            Some(source) => source.prior_for(year, grid, classes)?,
            None => None,
        };
        if prior.is_none() {
            provenance.warn(format!(
                "no temporal prior for {}, classifier probabilities used unfused",
                year
            ));
        }

        let (rows, cols) = grid.shape();
        let k = classes.len();
        let (rule, alpha) = (self.params.rule, self.params.prior_alpha);
        let pixels = self.executor.collect(rows, |tile| {
            let mut out = Vec::with_capacity(tile.len() * cols);
            for row in tile.rows() {
                for col in 0..cols {
                    let fused = match rf.pixel(row, col) {
                        None => FusedPixel { probs: None, prior_used: false },
                        Some(p_rf) => {
                            let p_prior = prior.as_ref().and_then(|p| p.pixel(row, col));
                            FusedPixel {
                                probs: Some(fuse_pixel(rule, alpha, &p_rf, p_prior.as_deref())),
                                prior_used: p_prior.is_some(),
                            }
                        }
                    };
                    out.push(fused);
                }
            }
            out
        });

        let mut data = Array3::<f64>::from_elem((k, rows, cols), f64::NAN);
        let mut labels = Array2::<ClassId>::from_elem((rows, cols), NO_CLASS);
        let mut confidence = Array2::<f64>::from_elem((rows, cols), f64::NAN);
        let (mut valid, mut without_prior) = (0usize, 0usize);
        for (i, pixel) in pixels.into_iter().enumerate() {
            let (row, col) = (i / cols, i % cols);
            let Some(probs) = pixel.probs else {
                continue;
            };
            valid += 1;
            if !pixel.prior_used {
                without_prior += 1;
            }
            if let Some((class, p)) = argmax(classes, &probs) {
                labels[[row, col]] = class;
                confidence[[row, col]] = p;
            }
            for (c, p) in probs.into_iter().enumerate() {
                data[[c, row, col]] = p;
            }
        }
        if prior.is_some() && without_prior > 0 {
            provenance.warn(format!(
                "{} of {} valid pixels have no temporal prior, classifier probabilities used there",
                without_prior, valid
            ));
        }
        if valid == 0 {
            provenance.warn(format!("no valid predictor pixels for {}", year));
        }
        provenance.param("valid_pixels", valid);

        log::info!(
            "Back-cast {}: {} valid pixels, {} without prior",
            year,
            valid,
            without_prior
        );

        let output = Backcast {
            labels: LabelMap {
                classes: Raster::from_array(grid.clone(), labels)?,
                confidence: Raster::from_array(grid.clone(), confidence)?,
            },
            probabilities: ClassProbabilities::from_array(grid.clone(), classes.to_vec(), data)?,
        };
        Ok(Artifact::new(output, provenance))
    }
}
