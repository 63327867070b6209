//! Row-tiled execution for single-raster operations.
//!
//! Tiles are horizontal bands of rows. Each tile is computed independently
//! from read-only inputs and the results are concatenated in tile order,
//! so the output never depends on scheduling.

use crate::types::{BackcastError, BackcastResult};
use ndarray::Array2;
use std::ops::Range;

/// A band of consecutive rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowTile {
    pub start: usize,
    pub end: usize,
}

impl RowTile {
    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Executor for tiled raster operations
#[derive(Debug, Clone, Copy)]
pub struct TileExecutor {
    tile_rows: usize,
}

impl Default for TileExecutor {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TileExecutor {
    pub fn new(tile_rows: usize) -> Self {
        Self {
            tile_rows: tile_rows.max(1),
        }
    }

    pub fn tile_rows(&self) -> usize {
        self.tile_rows
    }

    /// Tiles covering `rows`, in order
    pub fn tiles(&self, rows: usize) -> Vec<RowTile> {
        (0..rows)
            .step_by(self.tile_rows)
            .map(|start| RowTile {
                start,
                end: (start + self.tile_rows).min(rows),
            })
            .collect()
    }

    /// Run `f` on every tile and concatenate the outputs in tile order.
    #[cfg(feature = "parallel")]
    pub fn collect<T, F>(&self, rows: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(RowTile) -> Vec<T> + Sync + Send,
    {
        use rayon::prelude::*;

        let parts: Vec<Vec<T>> = self.tiles(rows).into_par_iter().map(f).collect();
        parts.into_iter().flatten().collect()
    }

    #[cfg(not(feature = "parallel"))]
    pub fn collect<T, F>(&self, rows: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(RowTile) -> Vec<T> + Sync + Send,
    {
        self.tiles(rows).into_iter().flat_map(f).collect()
    }

    /// Evaluate `f(row, col)` for every cell of a `shape` grid.
    pub fn map_cells<T, F>(&self, shape: (usize, usize), f: F) -> BackcastResult<Array2<T>>
    where
        T: Send,
        F: Fn(usize, usize) -> T + Sync + Send,
    {
        let (rows, cols) = shape;
        let values = self.collect(rows, |tile| {
            let mut out = Vec::with_capacity(tile.len() * cols);
            for row in tile.rows() {
                for col in 0..cols {
                    out.push(f(row, col));
                }
            }
            out
        });
        Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| BackcastError::Processing(format!("Failed to assemble tiles: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiles_cover_all_rows_once() {
        let executor = TileExecutor::new(32);
        let tiles = executor.tiles(100);
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[0], RowTile { start: 0, end: 32 });
        assert_eq!(tiles[3], RowTile { start: 96, end: 100 });
        let covered: usize = tiles.iter().map(RowTile::len).sum();
        assert_eq!(covered, 100);
    }

    #[test]
    fn test_map_cells_is_independent_of_tile_size() {
        let small = TileExecutor::new(1).map_cells((7, 5), |r, c| r * 10 + c).unwrap();
        let large = TileExecutor::new(1000).map_cells((7, 5), |r, c| r * 10 + c).unwrap();
        assert_eq!(small, large);
        assert_eq!(small[[6, 4]], 64);
    }

    #[test]
    fn test_empty_raster() {
        let out = TileExecutor::default().map_cells((0, 3), |_, _| 1u8).unwrap();
        assert_eq!(out.dim(), (0, 3));
    }
}
