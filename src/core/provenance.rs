//! Provenance records attached to every produced artifact.
//!
//! Data-quality warnings are recorded here as well as logged, so that
//! downstream consumers can inspect them from the artifact alone.

use crate::types::SensorGroup;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Processor version stamped into every record
pub const PROCESSOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Processing stage that produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Composite,
    Harmonized,
    Predictors,
    Classification,
    Transitions,
}

/// Provenance of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub kind: ArtifactKind,
    pub year: Option<i32>,
    pub sensor_group: Option<SensorGroup>,
    pub resolution_m: Option<f64>,
    pub source_years: Vec<i32>,
    pub parameters: BTreeMap<String, Value>,
    pub model_version: Option<String>,
    pub processor_version: String,
    pub warnings: Vec<String>,
}

impl Provenance {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            year: None,
            sensor_group: None,
            resolution_m: None,
            source_years: Vec::new(),
            parameters: BTreeMap::new(),
            model_version: None,
            processor_version: PROCESSOR_VERSION.to_string(),
            warnings: Vec::new(),
        }
    }

    pub fn for_year(kind: ArtifactKind, year: i32) -> Self {
        let mut provenance = Self::new(kind);
        provenance.year = Some(year);
        provenance
    }

    pub fn with_sensor_group(mut self, group: SensorGroup) -> Self {
        self.sensor_group = Some(group);
        self.resolution_m = Some(group.resolution_m());
        self
    }

    pub fn with_source_years(mut self, years: impl IntoIterator<Item = i32>) -> Self {
        self.source_years = years.into_iter().collect();
        self.source_years.sort_unstable();
        self.source_years.dedup();
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Record a processing parameter
    pub fn param(&mut self, key: &str, value: impl Into<Value>) {
        self.parameters.insert(key.to_string(), value.into());
    }

    /// Log a warning and attach it to this record
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self.year {
            Some(year) => log::warn!("[{:?} {}] {}", self.kind, year, message),
            None => log::warn!("[{:?}] {}", self.kind, message),
        }
        self.warnings.push(message);
    }

    /// Carry the warnings of an upstream artifact into this one
    pub fn inherit_warnings(&mut self, upstream: &Provenance) {
        for warning in &upstream.warnings {
            let tagged = match upstream.year {
                Some(year) => format!("{:?} {}: {}", upstream.kind, year, warning),
                None => format!("{:?}: {}", upstream.kind, warning),
            };
            if !self.warnings.contains(&tagged) {
                self.warnings.push(tagged);
            }
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// An immutable stage output together with its provenance
#[derive(Debug, Clone)]
pub struct Artifact<T> {
    pub data: T,
    pub provenance: Provenance,
}

impl<T> Artifact<T> {
    pub fn new(data: T, provenance: Provenance) -> Self {
        Self { data, provenance }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Artifact<U> {
        Artifact {
            data: f(self.data),
            provenance: self.provenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_are_attached() {
        let mut provenance = Provenance::for_year(ArtifactKind::Composite, 1975)
            .with_sensor_group(SensorGroup::Mss);
        provenance.warn("no observations in window");
        assert!(provenance.has_warnings());
        assert_eq!(provenance.resolution_m, Some(60.0));

        let mut downstream = Provenance::for_year(ArtifactKind::Harmonized, 1975);
        downstream.inherit_warnings(&provenance);
        downstream.inherit_warnings(&provenance);
        assert_eq!(downstream.warnings.len(), 1);
        assert!(downstream.warnings[0].contains("no observations"));
    }

    #[test]
    fn test_serialized_record_is_stable() {
        let mut provenance = Provenance::for_year(ArtifactKind::Classification, 1980)
            .with_source_years([1990, 1990, 1980]);
        provenance.param("prior_alpha", 0.7);
        let a = serde_json::to_string(&provenance).unwrap();
        let b = serde_json::to_string(&provenance.clone()).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"kind\":\"classification\""));
        assert_eq!(provenance.source_years, vec![1980, 1990]);
    }
}
