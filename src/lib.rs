//! backcast: historical land-cover back-casting from archival Landsat imagery
//!
//! Seasonal greenest-pixel composites are built per year and sensor group,
//! harmonised onto a reference year, classified by a random forest trained
//! on reference-year labels, fused with a temporal prior from later label
//! maps, and cleaned up to a minimum mapping unit. Transition statistics
//! between label years provide a quality check.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::PipelineConfig;
pub use crate::core::{Artifact, Pipeline, PipelineInputs, PipelineOutputs, Provenance, Stage};
pub use io::{ArtifactWriter, LoadedInputs};
pub use types::{
    BackcastError, BackcastResult, BoundingBox, ClassId, ClassProbabilities, GeoTransform, GridSpec, Raster,
    RasterValue, Sensor, SensorGroup, NO_CLASS,
};
