//! Temporal class priors derived from a multi-year label record.

use crate::types::{BackcastError, BackcastResult, ClassId, ClassProbabilities, GridSpec, Raster, RasterValue};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-pixel class prior; pixels without a prior hold NaN in every class band
pub type TemporalPrior = ClassProbabilities;

/// External source of temporal priors
pub trait PriorSource: Sync {
    /// Prior for `year` expressed over `classes`, `None` if the source has
    /// nothing for that year.
    fn prior_for(&self, year: i32, grid: &GridSpec, classes: &[ClassId]) -> BackcastResult<Option<TemporalPrior>>;
}

/// Label years averaged together and weighted as one term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorGroup {
    pub years: Vec<i32>,
    pub weight: f64,
}

impl PriorGroup {
    pub fn new(years: Vec<i32>, weight: f64) -> Self {
        Self { years, weight }
    }

    /// 1990 dominates, the 2000s and 2010s pull the trend
    pub fn defaults() -> Vec<PriorGroup> {
        vec![
            PriorGroup::new(vec![1990], 0.7),
            PriorGroup::new(vec![2000, 2006], 0.2),
            PriorGroup::new(vec![2012, 2018], 0.1),
        ]
    }
}

/// Weighted class frequency over groups of later label years.
///
/// For each pixel, `P(c) = sum_g w_g * mean_{y in g}[label_y == c] / sum w_g`
/// where only groups with a valid label at the pixel contribute. The same
/// prior is returned for every back-cast year.
#[derive(Debug, Clone)]
pub struct WeightedLabelPrior {
    groups: Vec<PriorGroup>,
    labels: BTreeMap<i32, Raster<ClassId>>,
}

impl WeightedLabelPrior {
    pub fn new(groups: Vec<PriorGroup>, labels: BTreeMap<i32, Raster<ClassId>>) -> BackcastResult<Self> {
        if groups.is_empty() {
            return Err(BackcastError::Config("Temporal prior needs at least one year group".to_string()));
        }
        for group in &groups {
            if group.years.is_empty() || !(group.weight.is_finite() && group.weight > 0.0) {
                return Err(BackcastError::Config(format!("Invalid prior group {:?}", group)));
            }
        }
        let mut grids = labels.iter();
        if let Some((_, first)) = grids.next() {
            for (year, raster) in grids {
                first.grid().ensure_same(raster.grid(), &format!("prior labels {}", year))?;
            }
        }
        for group in &groups {
            for year in &group.years {
                if !labels.contains_key(year) {
                    log::warn!("No label raster for prior year {}", year);
                }
            }
        }
        Ok(Self { groups, labels })
    }

    pub fn groups(&self) -> &[PriorGroup] {
        &self.groups
    }

    /// Label years that actually contribute
    pub fn years(&self) -> Vec<i32> {
        self.groups
            .iter()
            .flat_map(|g| g.years.iter().copied())
            .filter(|y| self.labels.contains_key(y))
            .collect()
    }

    fn pixel_prior(&self, row: usize, col: usize, classes: &[ClassId], out: &mut [f64]) {
        out.iter_mut().for_each(|p| *p = 0.0);
        let mut total_weight = 0.0;
        for group in &self.groups {
            let mut freq = vec![0.0; classes.len()];
            let mut seen = 0usize;
            for year in &group.years {
                let Some(raster) = self.labels.get(year) else {
                    continue;
                };
                let label = raster.get(row, col);
                if label.is_nodata() {
                    continue;
                }
                seen += 1;
                if let Ok(k) = classes.binary_search(&label) {
                    freq[k] += 1.0;
                }
            }
            if seen == 0 {
                continue;
            }
            total_weight += group.weight;
            for (p, f) in out.iter_mut().zip(&freq) {
                *p += group.weight * f / seen as f64;
            }
        }
        if total_weight > 0.0 {
            out.iter_mut().for_each(|p| *p /= total_weight);
        } else {
            out.iter_mut().for_each(|p| *p = f64::NAN);
        }
    }
}

impl PriorSource for WeightedLabelPrior {
    fn prior_for(&self, year: i32, grid: &GridSpec, classes: &[ClassId]) -> BackcastResult<Option<TemporalPrior>> {
        if self.labels.is_empty() {
            return Ok(None);
        }
        for (label_year, raster) in &self.labels {
            grid.ensure_same(raster.grid(), &format!("prior labels {}", label_year))?;
        }
        let (rows, cols) = grid.shape();
        let mut data = Array3::<f64>::zeros((classes.len(), rows, cols));
        let mut buf = vec![0.0; classes.len()];
        for row in 0..rows {
            for col in 0..cols {
                self.pixel_prior(row, col, classes, &mut buf);
                for (k, p) in buf.iter().enumerate() {
                    data[[k, row, col]] = *p;
                }
            }
        }
        log::debug!("Temporal prior for {} from label years {:?}", year, self.years());
        ClassProbabilities::from_array(grid.clone(), classes.to_vec(), data).map(Some)
    }
}

/// Precomputed priors keyed by year
#[derive(Debug, Clone, Default)]
pub struct InMemoryPrior {
    priors: BTreeMap<i32, TemporalPrior>,
}

impl InMemoryPrior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, year: i32, prior: TemporalPrior) {
        self.priors.insert(year, prior);
    }
}

impl PriorSource for InMemoryPrior {
    fn prior_for(&self, year: i32, grid: &GridSpec, classes: &[ClassId]) -> BackcastResult<Option<TemporalPrior>> {
        match self.priors.get(&year) {
            Some(prior) => {
                grid.ensure_same(prior.grid(), &format!("temporal prior {}", year))?;
                prior.align_to(classes).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;

    fn grid() -> GridSpec {
        GridSpec::new(1, 3, GeoTransform::north_up(0.0, 1.0, 1.0), "EPSG:32635")
    }

    fn labels(values: [ClassId; 3]) -> Raster<ClassId> {
        Raster::from_array(grid(), Array2::from_shape_vec((1, 3), values.to_vec()).unwrap()).unwrap()
    }

    #[test]
    fn test_weighted_frequencies() {
        let mut record = BTreeMap::new();
        record.insert(1990, labels([3, 3, 0]));
        record.insert(2000, labels([3, 1, 0]));
        record.insert(2006, labels([1, 1, 0]));
        record.insert(2012, labels([1, 1, 0]));
        record.insert(2018, labels([1, 1, 0]));
        let prior = WeightedLabelPrior::new(PriorGroup::defaults(), record).unwrap();
        let p = prior.prior_for(1980, &grid(), &[1, 3]).unwrap().unwrap();

        // 0.7 * 1 + 0.2 * 0.5 + 0.1 * 0 for class 3
        let px = p.pixel(0, 0).unwrap();
        assert!((px[1] - 0.8).abs() < 1e-12);
        assert!((px[0] - 0.2).abs() < 1e-12);
        // Nodata in every year leaves the prior absent
        assert!(p.pixel(0, 2).is_none());
    }

    #[test]
    fn test_missing_groups_renormalise() {
        let mut record = BTreeMap::new();
        record.insert(2012, labels([2, 2, 2]));
        let prior = WeightedLabelPrior::new(PriorGroup::defaults(), record).unwrap();
        let p = prior.prior_for(1975, &grid(), &[1, 2]).unwrap().unwrap();
        assert_eq!(p.pixel(0, 1).unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_in_memory_prior_absent_year() {
        let source = InMemoryPrior::new();
        assert!(source.prior_for(1985, &grid(), &[1, 2]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_group_rejected() {
        let groups = vec![PriorGroup::new(vec![1990], 0.0)];
        assert!(WeightedLabelPrior::new(groups, BTreeMap::new()).is_err());
    }
}
