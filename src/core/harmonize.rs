//! Cross-sensor radiometric harmonisation by percentile mapping.
//!
//! The low/high percentiles of a target composite are mapped linearly onto
//! those of the reference composite:
//!
//! ```text
//! scale  = (P_high_ref - P_low_ref) / (P_high_target - P_low_target)
//! offset = P_low_ref - P_low_target * scale
//! value' = clamp(value * scale + offset, -1, 1)
//! ```

use crate::core::boundary::AoiMask;
use crate::core::provenance::{Artifact, ArtifactKind, Provenance};
use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, Raster, RasterValue};
use serde::{Deserialize, Serialize};

/// Percentile pair used for the mapping
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonizationParams {
    pub low_percentile: f64,
    pub high_percentile: f64,
}

impl Default for HarmonizationParams {
    fn default() -> Self {
        Self {
            low_percentile: 2.0,
            high_percentile: 98.0,
        }
    }
}

impl HarmonizationParams {
    pub fn validate(&self) -> BackcastResult<()> {
        let ok = self.low_percentile.is_finite()
            && self.high_percentile.is_finite()
            && 0.0 < self.low_percentile
            && self.low_percentile < self.high_percentile
            && self.high_percentile < 100.0;
        if !ok {
            return Err(BackcastError::Config(format!(
                "Harmonisation percentiles must satisfy 0 < low < high < 100, got {}/{}",
                self.low_percentile, self.high_percentile
            )));
        }
        Ok(())
    }
}

/// Low and high percentile of one raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentilePair {
    pub low: f64,
    pub high: f64,
}

impl PercentilePair {
    pub fn spread(&self) -> f64 {
        self.high - self.low
    }
}

/// Percentile of ascending-sorted values with linear interpolation between
/// closest ranks (rank = p/100 * (n - 1)).
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Valid values of `raster` inside the AOI, ascending
pub fn sorted_valid_values(raster: &Raster<f64>, aoi: Option<&AoiMask>, executor: &TileExecutor) -> Vec<f64> {
    let (_, cols) = raster.grid().shape();
    let mut values = executor.collect(raster.grid().rows, |tile| {
        let mut out = Vec::new();
        for row in tile.rows() {
            for col in 0..cols {
                let v = raster.get(row, col);
                if v.is_valid() && aoi.map_or(true, |m| m.contains(row, col)) {
                    out.push(v);
                }
            }
        }
        out
    });
    values.sort_unstable_by(f64::total_cmp);
    values
}

/// Low/high percentiles over valid pixels, `None` for an all-nodata raster
pub fn percentile_pair(
    raster: &Raster<f64>,
    aoi: Option<&AoiMask>,
    params: &HarmonizationParams,
    executor: &TileExecutor,
) -> Option<PercentilePair> {
    let sorted = sorted_valid_values(raster, aoi, executor);
    Some(PercentilePair {
        low: percentile_of_sorted(&sorted, params.low_percentile)?,
        high: percentile_of_sorted(&sorted, params.high_percentile)?,
    })
}

/// Affine map fitted from reference and target percentiles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonizationModel {
    pub reference: Option<PercentilePair>,
    pub target: Option<PercentilePair>,
    pub scale: f64,
    pub offset: f64,
    /// True when the identity transform was used instead of a fitted map
    pub fallback: bool,
}

impl HarmonizationModel {
    pub fn identity(reference: Option<PercentilePair>, target: Option<PercentilePair>) -> Self {
        Self {
            reference,
            target,
            scale: 1.0,
            offset: 0.0,
            fallback: true,
        }
    }

    /// Fit the mapping. Any degenerate input yields the identity transform
    /// together with the reason.
    pub fn fit(reference: Option<PercentilePair>, target: Option<PercentilePair>) -> (Self, Option<String>) {
        let (r, t) = match (reference, target) {
            (Some(r), Some(t)) => (r, t),
            (None, _) => {
                return (
                    Self::identity(reference, target),
                    Some("reference composite has no valid pixels, identity transform used".to_string()),
                )
            }
            (_, None) => {
                return (
                    Self::identity(reference, target),
                    Some("target composite has no valid pixels, identity transform used".to_string()),
                )
            }
        };

        let target_spread = t.spread();
        if target_spread == 0.0 || !target_spread.is_finite() {
            return (
                Self::identity(reference, target),
                Some(format!(
                    "target percentile spread is {} (P_low={}, P_high={}), identity transform used",
                    target_spread, t.low, t.high
                )),
            );
        }
        let scale = r.spread() / target_spread;
        if !(scale.is_finite() && scale > 0.0) {
            return (
                Self::identity(reference, target),
                Some(format!("reference percentile spread is {}, identity transform used", r.spread())),
            );
        }

        let model = Self {
            reference,
            target,
            scale,
            offset: r.low - t.low * scale,
            fallback: false,
        };
        (model, None)
    }

    pub fn apply_value(&self, value: f64) -> f64 {
        if value.is_nodata() {
            return value;
        }
        (value * self.scale + self.offset).clamp(-1.0, 1.0)
    }

    pub fn apply(&self, raster: &Raster<f64>) -> BackcastResult<Raster<f64>> {
        let data = raster.data().mapv(|v| self.apply_value(v));
        Raster::from_array(raster.grid().clone(), data)
    }
}

/// Harmonised composite together with the model that produced it
#[derive(Debug, Clone)]
pub struct Harmonized {
    pub index: Raster<f64>,
    pub model: HarmonizationModel,
}

/// Harmoniser bound to one reference composite.
///
/// Reference percentiles are computed once on construction and shared
/// read-only by every target year.
pub struct Harmonizer<'a> {
    params: HarmonizationParams,
    aoi: &'a AoiMask,
    reference: Option<PercentilePair>,
    reference_year: Option<i32>,
    executor: TileExecutor,
}

impl<'a> Harmonizer<'a> {
    pub fn new(
        reference: &Artifact<Raster<f64>>,
        aoi: &'a AoiMask,
        params: HarmonizationParams,
    ) -> BackcastResult<Self> {
        params.validate()?;
        aoi.grid().ensure_same(reference.data.grid(), "reference composite")?;
        let executor = TileExecutor::default();
        let pair = percentile_pair(&reference.data, Some(aoi), &params, &executor);
        match pair {
            Some(p) => log::info!(
                "Reference percentiles P{}={:.4} P{}={:.4}",
                params.low_percentile,
                p.low,
                params.high_percentile,
                p.high
            ),
            None => log::warn!("Reference composite has no valid pixels"),
        }
        Ok(Self {
            params,
            aoi,
            reference: pair,
            reference_year: reference.provenance.year,
            executor,
        })
    }

    pub fn reference_percentiles(&self) -> Option<PercentilePair> {
        self.reference
    }

    /// Harmonise one target composite onto the reference distribution
    pub fn harmonize(&self, target: &Artifact<Raster<f64>>) -> BackcastResult<Artifact<Harmonized>> {
        self.aoi.grid().ensure_same(target.data.grid(), "target composite")?;
        let target_pair = percentile_pair(&target.data, Some(self.aoi), &self.params, &self.executor);
        let (model, warning) = HarmonizationModel::fit(self.reference, target_pair);

        let mut provenance = Provenance::new(ArtifactKind::Harmonized);
        provenance.year = target.provenance.year;
        provenance.sensor_group = target.provenance.sensor_group;
        provenance.resolution_m = target.provenance.resolution_m;
        provenance.source_years = target
            .provenance
            .year
            .into_iter()
            .chain(self.reference_year)
            .collect();
        provenance.source_years.sort_unstable();
        provenance.source_years.dedup();
        provenance.inherit_warnings(&target.provenance);
        provenance.param("low_percentile", self.params.low_percentile);
        provenance.param("high_percentile", self.params.high_percentile);
        provenance.param("scale", model.scale);
        provenance.param("offset", model.offset);
        provenance.param("fallback", model.fallback);
        if let Some(warning) = warning {
            provenance.warn(warning);
        }

        log::info!(
            "Harmonising {:?}: scale={:.6} offset={:.6}{}",
            target.provenance.year,
            model.scale,
            model.offset,
            if model.fallback { " (identity fallback)" } else { "" }
        );

        let index = model.apply(&target.data)?;
        Ok(Artifact::new(Harmonized { index, model }, provenance))
    }
}
