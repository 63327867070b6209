//! Random-forest classifier trained on the reference-year predictor stack.
//!
//! Training pixels are drawn per class with a seeded shuffle. Each tree is a
//! `linfa-trees` CART grown on a bootstrap resample and a random subset of the
//! predictors, both drawn from its own seed (`seed + tree_index`), so a fixed
//! seed gives the same forest whether trees are grown in parallel or not.

use crate::core::features::{PredictorStack, N_PREDICTORS};
use crate::types::{BackcastError, BackcastResult, ClassId, ClassProbabilities, Raster, RasterValue};
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_trees::{DecisionTree, SplitQuality};
use ndarray::{Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters of the random forest and its training sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierParams {
    /// Number of trees in the ensemble
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Predictors seen by each tree, `None` for ceil(sqrt(k))
    pub max_features: Option<usize>,
    /// Upper bound on training pixels drawn per class
    pub samples_per_class: usize,
    /// Valid labelled pixels required before sampling
    pub min_training_pixels: usize,
    pub seed: u64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            n_trees: 300,
            max_depth: 16,
            min_samples_leaf: 1,
            max_features: None,
            samples_per_class: 500,
            min_training_pixels: 50,
            seed: 42,
        }
    }
}

impl ClassifierParams {
    pub fn validate(&self) -> BackcastResult<()> {
        if self.n_trees == 0 {
            return Err(BackcastError::Config("Ensemble size must be at least 1".to_string()));
        }
        if self.max_depth == 0 || self.min_samples_leaf == 0 {
            return Err(BackcastError::Config(format!(
                "Tree limits must be positive: max_depth={}, min_samples_leaf={}",
                self.max_depth, self.min_samples_leaf
            )));
        }
        if let Some(m) = self.max_features {
            if m == 0 || m > N_PREDICTORS {
                return Err(BackcastError::Config(format!(
                    "max_features must be in 1..={}, got {}",
                    N_PREDICTORS, m
                )));
            }
        }
        if self.samples_per_class == 0 {
            return Err(BackcastError::Config("samples_per_class must be at least 1".to_string()));
        }
        Ok(())
    }

    fn features_per_tree(&self) -> usize {
        self.max_features
            .unwrap_or_else(|| (N_PREDICTORS as f64).sqrt().ceil() as usize)
            .clamp(1, N_PREDICTORS)
    }
}

/// Predictor vectors and labels selected for training
#[derive(Debug, Clone, Default)]
pub struct TrainingSample {
    pub features: Vec<[f64; N_PREDICTORS]>,
    pub labels: Vec<ClassId>,
    /// Valid labelled pixels available before sampling
    pub available: usize,
}

impl TrainingSample {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn class_counts(&self) -> BTreeMap<ClassId, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }
}

/// Draw a class-stratified sample of pixels valid in both the stack and the
/// label raster. Labels outside `1..=n_classes` are ignored.
pub fn stratified_sample(
    stack: &PredictorStack,
    labels: &Raster<ClassId>,
    n_classes: ClassId,
    params: &ClassifierParams,
) -> BackcastResult<TrainingSample> {
    stack.grid().ensure_same(labels.grid(), "reference labels")?;
    let (rows, cols) = stack.grid().shape();

    let mut by_class: BTreeMap<ClassId, Vec<[f64; N_PREDICTORS]>> = BTreeMap::new();
    for row in 0..rows {
        for col in 0..cols {
            let label = labels.get(row, col);
            if label.is_nodata() || label > n_classes {
                continue;
            }
            if let Some(features) = stack.pixel(row, col) {
                by_class.entry(label).or_default().push(features);
            }
        }
    }

    let available: usize = by_class.values().map(Vec::len).sum();
    if available < params.min_training_pixels {
        return Err(BackcastError::Training(format!(
            "Only {} valid labelled pixels, at least {} required",
            available, params.min_training_pixels
        )));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut sample = TrainingSample {
        available,
        ..TrainingSample::default()
    };
    for (class, mut pixels) in by_class {
        pixels.shuffle(&mut rng);
        pixels.truncate(params.samples_per_class);
        sample.labels.extend(std::iter::repeat(class).take(pixels.len()));
        sample.features.extend(pixels);
    }
    log::info!(
        "Training sample: {} of {} labelled pixels across {} classes",
        sample.len(),
        available,
        sample.class_counts().len()
    );
    Ok(sample)
}

/// Opaque model producing per-pixel class probabilities
pub trait ProbabilisticClassifier: Send + Sync {
    /// Classes the model can emit, ascending
    fn classes(&self) -> &[ClassId];

    fn predict_proba(&self, stack: &PredictorStack) -> BackcastResult<ClassProbabilities>;

    /// Stable identifier recorded in provenance
    fn model_version(&self) -> String;
}

/// Bagged CART tree grown by `linfa-trees` on a random feature subspace
#[derive(Debug, Clone)]
struct BaggedTree {
    features: Vec<usize>,
    tree: DecisionTree<f64, usize>,
}

impl BaggedTree {
    /// Grow one tree on a bootstrap resample of the training set
    fn grow(
        records: &Array2<f64>,
        targets: &Array1<usize>,
        params: &ClassifierParams,
        seed: u64,
    ) -> BackcastResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = targets.len();
        let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        let mut features = rand::seq::index::sample(&mut rng, N_PREDICTORS, params.features_per_tree()).into_vec();
        features.sort_unstable();

        let dataset = DatasetBase::new(
            records.select(Axis(0), &rows).select(Axis(1), &features),
            targets.select(Axis(0), &rows),
        );
        let tree = DecisionTree::params()
            .split_quality(SplitQuality::Gini)
            .max_depth(Some(params.max_depth))
            .min_weight_leaf(params.min_samples_leaf as f32)
            .min_weight_split(2.0 * params.min_samples_leaf as f32)
            .fit(&dataset)
            .map_err(|e| BackcastError::Training(format!("Tree {} failed to fit: {}", seed, e)))?;
        Ok(Self { features, tree })
    }

    fn predict(&self, records: &Array2<f64>) -> Array1<usize> {
        self.tree.predict(&records.select(Axis(1), &self.features))
    }
}

/// Summary of a trained forest, written next to classification outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_version: String,
    pub classes: Vec<ClassId>,
    pub n_trees: usize,
    pub mean_depth: f64,
    pub training_pixels: usize,
    pub available_pixels: usize,
    pub class_counts: BTreeMap<ClassId, usize>,
}

/// Ensemble of bagged trees; class probability is the share of tree votes
#[derive(Debug, Clone)]
pub struct RandomForest {
    classes: Vec<ClassId>,
    trees: Vec<BaggedTree>,
    params: ClassifierParams,
    class_counts: BTreeMap<ClassId, usize>,
    available: usize,
}

impl RandomForest {
    pub fn fit(sample: &TrainingSample, params: &ClassifierParams) -> BackcastResult<Self> {
        params.validate()?;
        if sample.is_empty() {
            return Err(BackcastError::Training("Empty training sample".to_string()));
        }
        let class_counts = sample.class_counts();
        let classes: Vec<ClassId> = class_counts.keys().copied().collect();
        if classes.len() < 2 {
            log::warn!("Training sample holds a single class {:?}", classes);
        }
        let records = to_records(&sample.features);
        let targets: Array1<usize> = sample
            .labels
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        log::info!(
            "Growing {} trees on {} samples ({} classes)",
            params.n_trees,
            sample.len(),
            classes.len()
        );
        let trees = Self::grow_trees(&records, &targets, params)?;

        Ok(Self {
            classes,
            trees,
            params: params.clone(),
            class_counts,
            available: sample.available,
        })
    }

    #[cfg(feature = "parallel")]
    fn grow_trees(
        records: &Array2<f64>,
        targets: &Array1<usize>,
        params: &ClassifierParams,
    ) -> BackcastResult<Vec<BaggedTree>> {
        use rayon::prelude::*;

        (0..params.n_trees)
            .into_par_iter()
            .map(|i| BaggedTree::grow(records, targets, params, params.seed.wrapping_add(i as u64)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn grow_trees(
        records: &Array2<f64>,
        targets: &Array1<usize>,
        params: &ClassifierParams,
    ) -> BackcastResult<Vec<BaggedTree>> {
        (0..params.n_trees)
            .map(|i| BaggedTree::grow(records, targets, params, params.seed.wrapping_add(i as u64)))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn votes(&self, records: &Array2<f64>) -> Vec<Array1<usize>> {
        use rayon::prelude::*;

        self.trees.par_iter().map(|tree| tree.predict(records)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn votes(&self, records: &Array2<f64>) -> Vec<Array1<usize>> {
        self.trees.iter().map(|tree| tree.predict(records)).collect()
    }

    /// Vote shares for a batch of predictor vectors, one row per vector
    pub fn predict_rows(&self, rows: &[[f64; N_PREDICTORS]]) -> Array2<f64> {
        let mut shares = Array2::<f64>::zeros((rows.len(), self.classes.len()));
        if rows.is_empty() {
            return shares;
        }
        for votes in self.votes(&to_records(rows)) {
            for (i, &class) in votes.iter().enumerate() {
                shares[[i, class]] += 1.0;
            }
        }
        shares /= self.trees.len() as f64;
        shares
    }

    /// Vote shares for one predictor vector
    pub fn predict_pixel(&self, x: &[f64; N_PREDICTORS]) -> Vec<f64> {
        self.predict_rows(std::slice::from_ref(x)).into_raw_vec()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn summary(&self) -> ModelSummary {
        let mean_depth =
            self.trees.iter().map(|t| t.tree.max_depth() as f64).sum::<f64>() / self.trees.len().max(1) as f64;
        ModelSummary {
            model_version: self.model_version(),
            classes: self.classes.clone(),
            n_trees: self.trees.len(),
            mean_depth,
            training_pixels: self.class_counts.values().sum(),
            available_pixels: self.available,
            class_counts: self.class_counts.clone(),
        }
    }
}

fn to_records(rows: &[[f64; N_PREDICTORS]]) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), N_PREDICTORS), |(i, j)| rows[i][j])
}

impl ProbabilisticClassifier for RandomForest {
    fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    fn predict_proba(&self, stack: &PredictorStack) -> BackcastResult<ClassProbabilities> {
        let (rows, cols) = stack.grid().shape();
        let mut pixels = Vec::new();
        let mut vectors = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                if let Some(x) = stack.pixel(row, col) {
                    pixels.push((row, col));
                    vectors.push(x);
                }
            }
        }

        let shares = self.predict_rows(&vectors);
        let mut data = Array3::from_elem((self.classes.len(), rows, cols), f64::NAN);
        for (i, &(row, col)) in pixels.iter().enumerate() {
            for (k, &p) in shares.row(i).iter().enumerate() {
                data[[k, row, col]] = p;
            }
        }
        ClassProbabilities::from_array(stack.grid().clone(), self.classes.clone(), data)
    }

    fn model_version(&self) -> String {
        format!(
            "rf-{}t-d{}-l{}-f{}-s{}-n{}",
            self.params.n_trees,
            self.params.max_depth,
            self.params.min_samples_leaf,
            self.params.features_per_tree(),
            self.params.seed,
            self.class_counts.values().sum::<usize>()
        )
    }
}

/// Trains the reference-year model
pub struct ClassifierTrainer {
    params: ClassifierParams,
    n_classes: ClassId,
}

impl ClassifierTrainer {
    pub fn new(params: ClassifierParams, n_classes: ClassId) -> BackcastResult<Self> {
        params.validate()?;
        if n_classes == 0 {
            return Err(BackcastError::Config("n_classes must be at least 1".to_string()));
        }
        Ok(Self { params, n_classes })
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    /// Fit on pixels valid in both `stack` and `labels`
    pub fn train(&self, stack: &PredictorStack, labels: &Raster<ClassId>) -> BackcastResult<RandomForest> {
        let sample = stratified_sample(stack, labels, self.n_classes, &self.params)?;
        let forest = RandomForest::fit(&sample, &self.params)?;
        log::info!("Trained model {}", forest.model_version());
        Ok(forest)
    }
}
