//! Input and output: observation sources, raster files and artifact writing

pub mod artifacts;
pub mod inputs;
pub mod observations;
pub mod raster_io;

pub use artifacts::ArtifactWriter;
pub use inputs::{FileObservations, LoadedInputs};
pub use observations::{InMemoryObservations, ObservationSource};
