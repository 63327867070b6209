//! Area-of-interest boundary and its rasterisation onto a grid.

use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, BoundingBox, GridSpec, Raster, RasterValue};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Spatial boundary constraining all processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Axis-aligned extent
    Extent(BoundingBox),
    /// Closed polygon ring in grid CRS coordinates
    Polygon(Vec<(f64, f64)>),
}

impl Boundary {
    pub fn validate(&self) -> BackcastResult<()> {
        match self {
            Boundary::Extent(bbox) => {
                if !(bbox.min_x < bbox.max_x && bbox.min_y < bbox.max_y) {
                    return Err(BackcastError::Config(format!("Degenerate boundary extent: {:?}", bbox)));
                }
            }
            Boundary::Polygon(ring) => {
                if ring.len() < 3 {
                    return Err(BackcastError::Config(format!(
                        "Boundary polygon needs at least 3 vertices, got {}",
                        ring.len()
                    )));
                }
                if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return Err(BackcastError::Config("Boundary polygon has non-finite vertices".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> BoundingBox {
        match self {
            Boundary::Extent(bbox) => *bbox,
            Boundary::Polygon(ring) => ring.iter().fold(
                BoundingBox {
                    min_x: f64::INFINITY,
                    max_x: f64::NEG_INFINITY,
                    min_y: f64::INFINITY,
                    max_y: f64::NEG_INFINITY,
                },
                |b, &(x, y)| BoundingBox {
                    min_x: b.min_x.min(x),
                    max_x: b.max_x.max(x),
                    min_y: b.min_y.min(y),
                    max_y: b.max_y.max(y),
                },
            ),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self {
            Boundary::Extent(bbox) => bbox.contains(x, y),
            Boundary::Polygon(ring) => {
                // Even-odd rule
                let mut inside = false;
                let n = ring.len();
                let mut j = n - 1;
                for i in 0..n {
                    let (xi, yi) = ring[i];
                    let (xj, yj) = ring[j];
                    if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                        inside = !inside;
                    }
                    j = i;
                }
                inside
            }
        }
    }

    /// Rasterise against pixel centres of `grid`
    pub fn rasterize(&self, grid: &GridSpec) -> BackcastResult<AoiMask> {
        let mask = TileExecutor::default().map_cells(grid.shape(), |row, col| {
            let (x, y) = grid.transform.pixel_center(row, col);
            self.contains(x, y)
        })?;
        Ok(AoiMask {
            grid: grid.clone(),
            mask,
        })
    }
}

/// Boolean AOI mask on a grid
#[derive(Debug, Clone)]
pub struct AoiMask {
    grid: GridSpec,
    mask: Array2<bool>,
}

impl AoiMask {
    /// Mask covering every pixel of `grid`
    pub fn full(grid: &GridSpec) -> Self {
        Self {
            grid: grid.clone(),
            mask: Array2::from_elem(grid.shape(), true),
        }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.mask[[row, col]]
    }

    pub fn inside_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Set everything outside the AOI to nodata
    pub fn clip<T: RasterValue>(&self, raster: &Raster<T>) -> BackcastResult<Raster<T>> {
        self.grid.ensure_same(raster.grid(), "AOI clip")?;
        let mut data = raster.data().clone();
        data.zip_mut_with(&self.mask, |v, &inside| {
            if !inside {
                *v = T::NODATA;
            }
        });
        Raster::from_array(raster.grid().clone(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;

    fn grid() -> GridSpec {
        GridSpec::new(4, 4, GeoTransform::north_up(0.0, 4.0, 1.0), "EPSG:32635")
    }

    #[test]
    fn test_triangle_rasterisation() {
        let boundary = Boundary::Polygon(vec![(0.0, 0.0), (3.9, 0.0), (0.0, 3.9)]);
        let mask = boundary.rasterize(&grid()).unwrap();
        // Lower-left triangle: centre (0.5, 0.5) inside, (3.5, 3.5) outside
        assert!(mask.contains(3, 0));
        assert!(!mask.contains(0, 3));
        assert_eq!(mask.inside_count(), 6);
    }

    #[test]
    fn test_extent_clip_sets_nodata() {
        let boundary = Boundary::Extent(BoundingBox { min_x: 0.0, max_x: 2.0, min_y: 0.0, max_y: 4.0 });
        let mask = boundary.rasterize(&grid()).unwrap();
        let raster = Raster::filled(grid(), 0.5);
        let clipped = mask.clip(&raster).unwrap();
        assert_eq!(clipped.get(0, 0), 0.5);
        assert!(clipped.get(0, 3).is_nan());
        assert_eq!(clipped.valid_count(), 8);
    }

    #[test]
    fn test_degenerate_boundaries_rejected() {
        assert!(Boundary::Polygon(vec![(0.0, 0.0), (1.0, 1.0)]).validate().is_err());
        let flat = BoundingBox { min_x: 1.0, max_x: 1.0, min_y: 0.0, max_y: 2.0 };
        assert!(Boundary::Extent(flat).validate().is_err());
    }
}
