use backcast::core::boundary::{AoiMask, Boundary};
use backcast::core::compositor::{greenest, Compositor, Observation, Scene, SeasonalWindow};
use backcast::types::{BoundingBox, GeoTransform, GridSpec, Raster, RasterValue, Sensor, SensorGroup};
use chrono::{DateTime, TimeZone, Utc};
use ndarray::array;

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, month, day, 10, 0, 0).unwrap()
}

fn grid() -> GridSpec {
    GridSpec::new(2, 3, GeoTransform::north_up(0.0, 2.0, 1.0), "EPSG:32635")
}

#[test]
fn test_tie_between_equal_maxima_keeps_earliest() {
    let _ = env_logger::builder().is_test(true).try_init();
    let obs = [
        Observation { acquired: at(6, 5), index: 0.2 },
        Observation { acquired: at(8, 20), index: 0.5 },
        Observation { acquired: at(7, 10), index: 0.5 },
    ];
    let best = greenest(&obs).unwrap();
    assert_eq!(best.index, 0.5);
    assert_eq!(best.acquired, at(7, 10));
}

#[test]
fn test_composite_is_per_pixel_maximum_with_clamping() {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = grid();
    let aoi = AoiMask::full(&g);
    let first = Raster::from_array(g.clone(), array![[0.2, f64::NAN, 1.4], [0.1, 0.3, -2.0]]).unwrap();
    let second = Raster::from_array(g.clone(), array![[0.5, 0.4, 0.9], [f64::NAN, 0.3, -0.5]]).unwrap();
    let scenes = vec![
        Scene::from_index(Sensor::Landsat1Mss, at(6, 10), first).unwrap(),
        Scene::from_index(Sensor::Landsat2Mss, at(7, 10), second).unwrap(),
    ];

    let composite = Compositor::new(&g, &aoi, SeasonalWindow::default())
        .compose(1980, SensorGroup::Mss, &scenes)
        .unwrap();
    let data = composite.data.data();
    assert_eq!(data[[0, 0]], 0.5);
    assert_eq!(data[[0, 1]], 0.4);
    assert_eq!(data[[0, 2]], 1.0);
    assert_eq!(data[[1, 0]], 0.1);
    assert_eq!(data[[1, 2]], -0.5);
    assert!(data.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert_eq!(composite.provenance.sensor_group, Some(SensorGroup::Mss));
    assert_eq!(composite.provenance.resolution_m, Some(60.0));
}

#[test]
fn test_pixels_outside_boundary_are_nodata() {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = grid();
    // covers the centres of the first two columns only
    let boundary = Boundary::Extent(BoundingBox { min_x: 0.0, max_x: 2.0, min_y: 0.0, max_y: 2.0 });
    let aoi = boundary.rasterize(&g).unwrap();
    let scenes = vec![Scene::from_index(Sensor::Landsat5Tm, at(7, 1), Raster::filled(g.clone(), 0.6)).unwrap()];

    let composite = Compositor::new(&g, &aoi, SeasonalWindow::default())
        .compose(1980, SensorGroup::Tm, &scenes)
        .unwrap();
    assert_eq!(composite.data.valid_count(), 4);
    assert!(composite.data.get(0, 2).is_nodata());
    assert_eq!(composite.data.get(1, 1), 0.6);
}
