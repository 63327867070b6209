//! Class transition statistics between two label years and a QC check for
//! ecologically improbable changes.

use crate::core::boundary::AoiMask;
use crate::core::provenance::{Artifact, ArtifactKind, Provenance};
use crate::types::{BackcastResult, ClassId, Raster, RasterValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Transition code `100 * from + to`
pub fn transition_code(from: ClassId, to: ClassId) -> u32 {
    100 * from as u32 + to as u32
}

/// A set of class changes that should rarely happen between two dates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprobableRule {
    pub name: String,
    pub from: Vec<ClassId>,
    pub to: Vec<ClassId>,
}

impl ImprobableRule {
    pub fn new(name: &str, from: &[ClassId], to: &[ClassId]) -> Self {
        Self {
            name: name.to_string(),
            from: from.to_vec(),
            to: to.to_vec(),
        }
    }

    /// Forest (3-5) to artificial (1), wetland (6) to and from artificial,
    /// wetland to forest.
    pub fn defaults() -> Vec<ImprobableRule> {
        vec![
            ImprobableRule::new("forest_to_artificial", &[3, 4, 5], &[1]),
            ImprobableRule::new("wetland_to_artificial", &[6], &[1]),
            ImprobableRule::new("artificial_to_wetland", &[1], &[6]),
            ImprobableRule::new("wetland_to_forest", &[6], &[3, 4, 5]),
        ]
    }

    pub fn matches(&self, from: ClassId, to: ClassId) -> bool {
        self.from.contains(&from) && self.to.contains(&to)
    }
}

/// One histogram row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRow {
    pub transition_code: u32,
    pub pixel_count: u64,
    pub from_year: i32,
    pub to_year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub from_year: i32,
    pub to_year: i32,
    pub rows: Vec<TransitionRow>,
    /// Pixels with a valid class in the `from` year
    pub valid_from_pixels: u64,
    pub improbable_pixels: u64,
    /// Improbable pixels as a percentage of `valid_from_pixels`
    pub improbable_pct: Option<f64>,
}

impl TransitionReport {
    pub fn pixel_count(&self, from: ClassId, to: ClassId) -> u64 {
        let code = transition_code(from, to);
        self.rows
            .iter()
            .find(|r| r.transition_code == code)
            .map_or(0, |r| r.pixel_count)
    }

    /// Write the rows as CSV, header taken from the row field names
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> BackcastResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn in_range(class: ClassId, n_classes: ClassId) -> bool {
    class.is_valid() && class <= n_classes
}

/// Compare two label maps pixel by pixel
pub fn analyze_transitions(
    (from_year, from): (i32, &Raster<ClassId>),
    (to_year, to): (i32, &Raster<ClassId>),
    n_classes: ClassId,
    rules: &[ImprobableRule],
    aoi: Option<&AoiMask>,
) -> BackcastResult<Artifact<TransitionReport>> {
    from.grid().ensure_same(to.grid(), "transition target")?;
    if let Some(mask) = aoi {
        mask.grid().ensure_same(from.grid(), "AOI mask")?;
    }

    let mut histogram: BTreeMap<u32, u64> = BTreeMap::new();
    let (mut valid_from, mut improbable) = (0u64, 0u64);
    for ((r, c), &a) in from.data().indexed_iter() {
        if !in_range(a, n_classes) || !aoi.map_or(true, |m| m.contains(r, c)) {
            continue;
        }
        valid_from += 1;
        let b = to.get(r, c);
        if !in_range(b, n_classes) {
            continue;
        }
        *histogram.entry(transition_code(a, b)).or_insert(0) += 1;
        if rules.iter().any(|rule| rule.matches(a, b)) {
            improbable += 1;
        }
    }

    let mut provenance = Provenance::new(ArtifactKind::Transitions).with_source_years([from_year, to_year]);
    provenance.param("n_classes", n_classes);
    provenance.param(
        "rules",
        rules.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
    );
    let improbable_pct = if valid_from > 0 {
        Some(improbable as f64 / valid_from as f64 * 100.0)
    } else {
        provenance.warn(format!("no valid pixels for {} -> {}", from_year, to_year));
        None
    };
    if let Some(pct) = improbable_pct {
        log::info!("QC {} -> {}: improbable transitions = {:.3}%", from_year, to_year, pct);
    }

    let rows = histogram
        .into_iter()
        .map(|(transition_code, pixel_count)| TransitionRow {
            transition_code,
            pixel_count,
            from_year,
            to_year,
        })
        .collect();
    let report = TransitionReport {
        from_year,
        to_year,
        rows,
        valid_from_pixels: valid_from,
        improbable_pixels: improbable,
        improbable_pct,
    };
    Ok(Artifact::new(report, provenance))
}
