//! Writing pipeline artifacts: GeoTIFF rasters with a JSON provenance
//! sidecar, transition tables as CSV and JSON.

use crate::core::classifier::ModelSummary;
use crate::core::harmonize::Harmonized;
use crate::core::pipeline::PipelineOutputs;
use crate::core::postprocess::PostProcessed;
use crate::core::provenance::{Artifact, Provenance};
use crate::core::transitions::TransitionReport;
use crate::io::raster_io;
use crate::types::{BackcastResult, Raster, SensorGroup};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Writes artifacts into one output directory
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    /// Create the output directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> BackcastResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> BackcastResult<PathBuf> {
        let path = self.dir.join(file_name);
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    /// `<name>.provenance.json`
    pub fn write_provenance(&self, name: &str, provenance: &Provenance) -> BackcastResult<PathBuf> {
        self.write_json(&format!("{}.provenance.json", name), provenance)
    }

    pub fn write_composite(
        &self,
        year: i32,
        group: SensorGroup,
        composite: &Artifact<Raster<f64>>,
    ) -> BackcastResult<Vec<PathBuf>> {
        let name = format!("composite_{}_{}", year, group);
        let tif = self.dir.join(format!("{}.tif", name));
        raster_io::write_raster(&tif, &composite.data)?;
        Ok(vec![tif, self.write_provenance(&name, &composite.provenance)?])
    }

    pub fn write_harmonized(&self, year: i32, harmonized: &Artifact<Harmonized>) -> BackcastResult<Vec<PathBuf>> {
        let name = format!("harmonized_{}", year);
        let tif = self.dir.join(format!("{}.tif", name));
        raster_io::write_raster(&tif, &harmonized.data.index)?;
        Ok(vec![tif, self.write_provenance(&name, &harmonized.provenance)?])
    }

    /// Class map, confidence, residual-MMU mask and fused probabilities sharing
    /// one provenance record
    pub fn write_classification(
        &self,
        year: i32,
        classification: &Artifact<PostProcessed>,
    ) -> BackcastResult<Vec<PathBuf>> {
        let name = format!("classification_{}", year);
        let classes = self.dir.join(format!("{}.tif", name));
        let confidence = self.dir.join(format!("confidence_{}.tif", year));
        raster_io::write_labels(&classes, &classification.data.labels.classes)?;
        raster_io::write_raster(&confidence, &classification.data.labels.confidence)?;
        let mut written = vec![classes, confidence];
        let residual = self.dir.join(format!("residual_{}.tif", year));
        raster_io::write_mask(&residual, classification.data.labels.classes.grid(), &classification.data.residual_mask)?;
        written.push(residual);
        if let Some(probabilities) = &classification.data.probabilities {
            let path = self.dir.join(format!("probabilities_{}.tif", year));
            raster_io::write_probabilities(&path, probabilities)?;
            written.push(path);
        }
        written.push(self.write_provenance(&name, &classification.provenance)?);
        Ok(written)
    }

    pub fn write_transitions(&self, report: &Artifact<TransitionReport>) -> BackcastResult<Vec<PathBuf>> {
        let name = format!("transitions_{}_{}", report.data.from_year, report.data.to_year);
        let csv = self.dir.join(format!("{}.csv", name));
        report.data.write_csv(&csv)?;
        let json = self.write_json(&format!("{}.json", name), &report.data)?;
        Ok(vec![csv, json, self.write_provenance(&name, &report.provenance)?])
    }

    pub fn write_model_summary(&self, summary: &ModelSummary) -> BackcastResult<PathBuf> {
        self.write_json("model_summary.json", summary)
    }

    /// Write every successful job of a run; failed jobs are skipped
    pub fn write_outputs(&self, outputs: &PipelineOutputs) -> BackcastResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for ((year, group), result) in &outputs.composites {
            if let Ok(composite) = result {
                written.extend(self.write_composite(*year, *group, composite)?);
            }
        }
        for (year, result) in &outputs.harmonized {
            if let Ok(harmonized) = result {
                written.extend(self.write_harmonized(*year, harmonized)?);
            }
        }
        if let Some(summary) = &outputs.model {
            written.push(self.write_model_summary(summary)?);
        }
        for (year, result) in &outputs.classifications {
            if let Ok(classification) = result {
                written.extend(self.write_classification(*year, classification)?);
            }
        }
        for result in outputs.transitions.values() {
            if let Ok(report) = result {
                written.extend(self.write_transitions(report)?);
            }
        }
        log::info!("Wrote {} files to {}", written.len(), self.dir.display());
        Ok(written)
    }
}
