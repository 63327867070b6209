//! GeoTIFF reading and writing through GDAL.
//!
//! Values equal to a band's nodata value are mapped to the in-memory nodata
//! marker (NaN for continuous rasters, class 0 for label rasters). Without the
//! `gdal` feature every call fails with a configuration error.

use crate::types::{BackcastResult, ClassId, ClassProbabilities, GridSpec, Raster};
use ndarray::Array2;
use std::path::Path;

#[cfg(feature = "gdal")]
mod gdal_backend {
    use crate::types::{BackcastError, BackcastResult, GeoTransform, GridSpec};
    use gdal::raster::{Buffer, GdalType};
    use gdal::spatial_ref::SpatialRef;
    use gdal::{Dataset, DriverManager};
    use ndarray::Array2;
    use std::path::Path;

    /// First band of a raster file with its grid and nodata value
    pub fn read_band<T: GdalType + Copy>(path: &Path) -> BackcastResult<(GridSpec, Array2<T>, Option<f64>)> {
        log::debug!("Reading raster: {}", path.display());
        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let grid = GridSpec::new(height, width, transform, dataset.projection());

        let band = dataset.rasterband(1)?;
        let nodata = band.no_data_value();
        let buffer = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;
        let data = Array2::from_shape_vec((height, width), buffer.data).map_err(|e| {
            BackcastError::Processing(format!("Failed to reshape {}: {}", path.display(), e))
        })?;
        Ok((grid, data, nodata))
    }

    /// Write `bands` (each `rows x cols`) into a new GeoTIFF
    pub fn write_bands<T: GdalType + Copy>(
        path: &Path,
        grid: &GridSpec,
        bands: Vec<Vec<T>>,
        nodata: Option<f64>,
    ) -> BackcastResult<()> {
        log::debug!("Writing {} band(s) to {}", bands.len(), path.display());
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<T, _>(
            path,
            grid.cols as isize,
            grid.rows as isize,
            bands.len() as isize,
        )?;
        dataset.set_geo_transform(&grid.transform.to_gdal())?;
        if !grid.crs.is_empty() {
            let wkt = SpatialRef::from_definition(&grid.crs)?.to_wkt()?;
            dataset.set_projection(&wkt)?;
        }

        for (i, data) in bands.into_iter().enumerate() {
            let mut band = dataset.rasterband(i as isize + 1)?;
            band.set_no_data_value(nodata)?;
            let buffer = Buffer::new((grid.cols, grid.rows), data);
            band.write((0, 0), (grid.cols, grid.rows), &buffer)?;
        }
        Ok(())
    }
}

/// Fail early when raster files cannot be read or written at all
pub fn ensure_available() -> BackcastResult<()> {
    if cfg!(feature = "gdal") {
        Ok(())
    } else {
        Err(crate::types::BackcastError::Config(
            "backcast was built without the `gdal` feature and cannot read or write rasters; \
             rebuild with `--features gdal`"
                .to_string(),
        ))
    }
}

#[cfg(not(feature = "gdal"))]
fn gdal_disabled<T>(path: &Path) -> BackcastResult<T> {
    Err(crate::types::BackcastError::Config(format!(
        "Cannot access {}: built without the `gdal` feature",
        path.display()
    )))
}

/// Read a continuous single-band raster (index, elevation, slope, reflectance)
#[cfg(feature = "gdal")]
pub fn read_raster<P: AsRef<Path>>(path: P) -> BackcastResult<Raster<f64>> {
    let (grid, mut data, nodata) = gdal_backend::read_band::<f64>(path.as_ref())?;
    if let Some(nd) = nodata {
        data.mapv_inplace(|v| if v == nd { f64::NAN } else { v });
    }
    Raster::from_array(grid, data)
}

#[cfg(not(feature = "gdal"))]
pub fn read_raster<P: AsRef<Path>>(path: P) -> BackcastResult<Raster<f64>> {
    gdal_disabled(path.as_ref())
}

/// Read a label raster; the band nodata value becomes class 0
#[cfg(feature = "gdal")]
pub fn read_labels<P: AsRef<Path>>(path: P) -> BackcastResult<Raster<ClassId>> {
    use crate::types::NO_CLASS;

    let (grid, mut data, nodata) = gdal_backend::read_band::<u8>(path.as_ref())?;
    if let Some(nd) = nodata {
        data.mapv_inplace(|v| if v as f64 == nd { NO_CLASS } else { v });
    }
    Raster::from_array(grid, data)
}

#[cfg(not(feature = "gdal"))]
pub fn read_labels<P: AsRef<Path>>(path: P) -> BackcastResult<Raster<ClassId>> {
    gdal_disabled(path.as_ref())
}

#[cfg(feature = "gdal")]
pub fn write_raster<P: AsRef<Path>>(path: P, raster: &Raster<f64>) -> BackcastResult<()> {
    let data = raster.data().iter().copied().collect();
    gdal_backend::write_bands(path.as_ref(), raster.grid(), vec![data], Some(f64::NAN))
}

#[cfg(not(feature = "gdal"))]
pub fn write_raster<P: AsRef<Path>>(path: P, _raster: &Raster<f64>) -> BackcastResult<()> {
    gdal_disabled(path.as_ref())
}

#[cfg(feature = "gdal")]
pub fn write_labels<P: AsRef<Path>>(path: P, raster: &Raster<ClassId>) -> BackcastResult<()> {
    let data = raster.data().iter().copied().collect();
    gdal_backend::write_bands(path.as_ref(), raster.grid(), vec![data], Some(0.0))
}

#[cfg(not(feature = "gdal"))]
pub fn write_labels<P: AsRef<Path>>(path: P, _raster: &Raster<ClassId>) -> BackcastResult<()> {
    gdal_disabled(path.as_ref())
}

/// Boolean mask as a byte band, 1 where set
#[cfg(feature = "gdal")]
pub fn write_mask<P: AsRef<Path>>(path: P, grid: &GridSpec, mask: &Array2<bool>) -> BackcastResult<()> {
    if mask.dim() != grid.shape() {
        return Err(crate::types::BackcastError::Validation(format!(
            "Mask of shape {:?} does not match the {}x{} grid",
            mask.dim(),
            grid.rows,
            grid.cols
        )));
    }
    let data = mask.iter().map(|&set| u8::from(set)).collect();
    gdal_backend::write_bands(path.as_ref(), grid, vec![data], None)
}

#[cfg(not(feature = "gdal"))]
pub fn write_mask<P: AsRef<Path>>(path: P, _grid: &GridSpec, _mask: &Array2<bool>) -> BackcastResult<()> {
    gdal_disabled(path.as_ref())
}

/// One band per class, in ascending class order
#[cfg(feature = "gdal")]
pub fn write_probabilities<P: AsRef<Path>>(path: P, probabilities: &ClassProbabilities) -> BackcastResult<()> {
    let bands = probabilities
        .data()
        .outer_iter()
        .map(|band| band.iter().copied().collect())
        .collect();
    gdal_backend::write_bands(path.as_ref(), probabilities.grid(), bands, Some(f64::NAN))
}

#[cfg(not(feature = "gdal"))]
pub fn write_probabilities<P: AsRef<Path>>(path: P, _probabilities: &ClassProbabilities) -> BackcastResult<()> {
    gdal_disabled(path.as_ref())
}

#[cfg(all(test, not(feature = "gdal")))]
mod tests {
    use super::*;

    #[test]
    fn test_without_gdal_is_config_error() {
        let err = read_raster("/tmp/elevation.tif").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("gdal"));

        let err = ensure_available().unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("--features gdal"));
    }
}
