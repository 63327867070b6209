//! Core back-casting modules

pub mod boundary;
pub mod classifier;
pub mod compositor;
pub mod features;
pub mod fusion;
pub mod harmonize;
pub mod pipeline;
pub mod postprocess;
pub mod prior;
pub mod provenance;
pub mod tiling;
pub mod transitions;

// Re-export main types
pub use boundary::{AoiMask, Boundary};
pub use classifier::{ClassifierParams, ClassifierTrainer, ModelSummary, ProbabilisticClassifier, RandomForest};
pub use compositor::{Compositor, DateRange, MonthDay, Scene, SeasonalWindow};
pub use features::{BaselineStats, FeatureBuilder, PredictorStack, TopographyLayers, PREDICTOR_BANDS};
pub use fusion::{Backcast, Backcaster, FusionParams, FusionRule, LabelMap};
pub use harmonize::{HarmonizationModel, HarmonizationParams, Harmonized, Harmonizer};
pub use pipeline::{Pipeline, PipelineInputs, PipelineOutputs, Stage};
pub use postprocess::{Connectivity, PostProcessParams, PostProcessReport, PostProcessed, PostProcessor};
pub use prior::{InMemoryPrior, PriorGroup, PriorSource, TemporalPrior, WeightedLabelPrior};
pub use provenance::{Artifact, ArtifactKind, Provenance};
pub use tiling::TileExecutor;
pub use transitions::{analyze_transitions, ImprobableRule, TransitionReport};
