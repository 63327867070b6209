use backcast::config::PipelineConfig;
use backcast::core::boundary::Boundary;
use backcast::core::compositor::Scene;
use backcast::core::features::TopographyLayers;
use backcast::core::pipeline::{Pipeline, PipelineInputs, Stage};
use backcast::io::InMemoryObservations;
use backcast::types::{BackcastError, ClassId, GeoTransform, GridSpec, Raster, Sensor, SensorGroup};
use chrono::{TimeZone, Utc};
use ndarray::Array2;
use std::collections::BTreeMap;

const FOREST: ClassId = 3;
const ARTIFICIAL: ClassId = 1;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn grid() -> GridSpec {
    GridSpec::new(20, 20, GeoTransform::north_up(500000.0, 4600000.0, 30.0), "EPSG:32635")
}

/// Forest on the left half, artificial on the right
fn reference_labels() -> Raster<ClassId> {
    let data = Array2::from_shape_fn((20, 20), |(_, c)| if c < 10 { FOREST } else { ARTIFICIAL });
    Raster::from_array(grid(), data).unwrap()
}

fn index_scene(sensor: Sensor, year: i32, month: u32, f: impl Fn(usize, usize) -> f64) -> Scene {
    let data = Array2::from_shape_fn((20, 20), |(r, c)| f(r, c));
    let acquired = Utc.with_ymd_and_hms(year, month, 15, 10, 0, 0).unwrap();
    Scene::from_index(sensor, acquired, Raster::from_array(grid(), data).unwrap()).unwrap()
}

fn reference_ndvi(_: usize, c: usize) -> f64 {
    if c < 10 {
        0.8
    } else {
        0.1
    }
}

fn topography() -> TopographyLayers {
    let elevation = Array2::from_shape_fn((20, 20), |(r, _)| 200.0 + 3.0 * r as f64);
    TopographyLayers::from_elevation(Raster::from_array(grid(), elevation).unwrap(), 30.0).unwrap()
}

fn config(years: &[(i32, Sensor)]) -> PipelineConfig {
    let years: BTreeMap<i32, Vec<Sensor>> = years.iter().map(|(y, s)| (*y, vec![*s])).collect();
    let mut config = PipelineConfig::new(1990, years, Boundary::Extent(grid().extent()));
    config.classifier.n_trees = 25;
    config.classifier.samples_per_class = 100;
    config
}

fn observations() -> InMemoryObservations {
    InMemoryObservations::new(vec![
        index_scene(Sensor::Landsat5Tm, 1990, 7, reference_ndvi),
        // an earlier, less green acquisition that the composite must ignore
        index_scene(Sensor::Landsat5Tm, 1990, 6, |r, c| reference_ndvi(r, c) - 0.05),
        // 1975 MSS with a compressed, shifted response
        index_scene(Sensor::Landsat2Mss, 1975, 8, |r, c| 0.5 * reference_ndvi(r, c) + 0.1),
    ])
}

#[test]
fn test_end_to_end_reproduces_stable_landscape() {
    init_logging();
    let grid = grid();
    let observations = observations();
    let topography = topography();
    let labels = reference_labels();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };

    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();
    let outputs = pipeline.run(Stage::All, &inputs).unwrap();
    assert_eq!(outputs.exit_code(), 0, "failures: {:?}", outputs.failures());

    let composite = outputs.composites[&(1990, SensorGroup::Tm)].as_ref().unwrap();
    assert!((composite.data.get(0, 0) - 0.8).abs() < 1e-12);
    assert_eq!(composite.provenance.resolution_m, Some(30.0));

    let reference = outputs.harmonized[&1990].as_ref().unwrap();
    assert!((reference.data.model.scale - 1.0).abs() < 1e-12);
    assert!(reference.data.model.offset.abs() < 1e-12);

    let historical = outputs.harmonized[&1975].as_ref().unwrap();
    assert!((historical.data.index.get(0, 0) - 0.8).abs() < 1e-6);
    assert!((historical.data.index.get(0, 19) - 0.1).abs() < 1e-6);

    let model = outputs.model.as_ref().unwrap();
    assert_eq!(model.classes, vec![ARTIFICIAL, FOREST]);
    assert_eq!(model.n_trees, 25);

    let classified = outputs.classifications[&1975].as_ref().unwrap();
    assert_eq!(classified.data.labels.classes.data(), labels.data());
    assert!(classified.data.report.converged);
    assert!(classified.data.labels.confidence.data().iter().all(|&p| p > 0.5));
    assert_eq!(classified.provenance.year, Some(1975));
    assert_eq!(classified.provenance.sensor_group, Some(SensorGroup::Mss));
    assert_eq!(classified.provenance.resolution_m, Some(60.0));
    assert_eq!(classified.provenance.source_years, vec![1975, 1990]);
    assert_eq!(classified.provenance.model_version.as_deref(), Some(model.model_version.as_str()));

    let transitions = outputs.transitions[&(1975, 1990)].as_ref().unwrap();
    assert_eq!(transitions.data.pixel_count(FOREST, FOREST), 200);
    assert_eq!(transitions.data.pixel_count(ARTIFICIAL, ARTIFICIAL), 200);
    assert_eq!(transitions.data.improbable_pct, Some(0.0));
}

#[test]
fn test_failed_year_does_not_block_siblings() {
    init_logging();
    let grid = grid();
    let mut observations = observations();
    let other = GridSpec::new(10, 10, GeoTransform::north_up(500000.0, 4600000.0, 60.0), "EPSG:32635");
    let acquired = Utc.with_ymd_and_hms(1985, 7, 1, 10, 0, 0).unwrap();
    observations.push(Scene::from_index(Sensor::Landsat5Tm, acquired, Raster::filled(other, 0.5)).unwrap());

    let topography = topography();
    let labels = reference_labels();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };

    let pipeline = Pipeline::new(config(&[
        (1975, Sensor::Landsat2Mss),
        (1985, Sensor::Landsat5Tm),
        (1990, Sensor::Landsat5Tm),
    ]))
    .unwrap();
    let outputs = pipeline.run(Stage::Classify, &inputs).unwrap();

    assert_eq!(outputs.composites[&(1985, SensorGroup::Tm)].as_ref().unwrap_err().exit_code(), 2);
    assert!(outputs.harmonized[&1985].is_err());
    assert!(outputs.classifications[&1985].is_err());
    assert!(outputs.classifications[&1975].is_ok());
    assert!(outputs.transitions.is_empty());
    assert_eq!(outputs.exit_code(), 3);
    assert_eq!(outputs.failures().len(), 3);
}

#[test]
fn test_compose_stage_stops_early() {
    init_logging();
    let grid = grid();
    let observations = observations();
    let topography = topography();
    let labels = reference_labels();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };
    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();
    let outputs = pipeline.run(Stage::Compose, &inputs).unwrap();
    assert_eq!(outputs.composites.len(), 2);
    assert!(outputs.harmonized.is_empty());
    assert!(outputs.model.is_none());
}

#[test]
fn test_no_observations_is_validation_error() {
    init_logging();
    let grid = grid();
    let observations = InMemoryObservations::default();
    let topography = topography();
    let labels = reference_labels();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };
    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();
    let outputs = pipeline.run(Stage::All, &inputs).unwrap();

    // empty composites are kept, everything behind the barrier is blocked
    let composite = outputs.composites[&(1975, SensorGroup::Mss)].as_ref().unwrap();
    assert!(composite.data.is_all_nodata());
    assert!(composite.provenance.has_warnings());
    assert!(outputs.harmonized.values().all(|r| r.is_err()));
    assert!(outputs.model.is_none());
    assert_eq!(outputs.classifications[&1975].as_ref().unwrap_err().exit_code(), 2);
    assert_eq!(outputs.exit_code(), 2);
}

#[test]
fn test_compose_stage_keeps_composites_when_reference_is_empty() {
    init_logging();
    let grid = grid();
    // only the 1975 MSS scene, nothing for the 1990 reference year
    let observations = InMemoryObservations::new(vec![index_scene(Sensor::Landsat2Mss, 1975, 8, reference_ndvi)]);
    let topography = topography();
    let labels = reference_labels();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };
    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();

    let outputs = pipeline.run(Stage::Compose, &inputs).unwrap();
    assert_eq!(outputs.exit_code(), 0);
    let historical = outputs.composites[&(1975, SensorGroup::Mss)].as_ref().unwrap();
    assert_eq!(historical.data.valid_count(), 400);
    let reference = outputs.composites[&(1990, SensorGroup::Tm)].as_ref().unwrap();
    assert!(reference.data.is_all_nodata());
    assert!(reference.provenance.has_warnings());

    let outputs = pipeline.run(Stage::Harmonize, &inputs).unwrap();
    assert!(outputs.composites[&(1975, SensorGroup::Mss)].is_ok());
    assert_eq!(outputs.harmonized[&1975].as_ref().unwrap_err().exit_code(), 2);
    assert_eq!(outputs.exit_code(), 2);
}

#[test]
fn test_too_few_labels_fails_before_any_year() {
    init_logging();
    let grid = grid();
    let observations = observations();
    let topography = topography();
    // a single labelled row: 20 pixels, below the 50 required
    let sparse = Array2::from_shape_fn((20, 20), |(r, c)| match (r, c) {
        (0, c) if c < 10 => FOREST,
        (0, _) => ARTIFICIAL,
        _ => 0,
    });
    let labels = Raster::from_array(grid.clone(), sparse).unwrap();
    let record = BTreeMap::new();
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };
    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();
    let outputs = pipeline.run(Stage::Classify, &inputs).unwrap();

    assert!(outputs.model.is_none());
    assert!(outputs.harmonized[&1975].is_ok());
    assert!(outputs.harmonized[&1990].is_ok());
    let err = outputs.classifications[&1975].as_ref().unwrap_err();
    assert!(matches!(err, BackcastError::Training(_)));
    assert_eq!(outputs.exit_code(), 3);
}

#[test]
fn test_transitions_stage_uses_label_record_only() {
    init_logging();
    let grid = grid();
    let observations = InMemoryObservations::default();
    let topography = topography();
    let labels = reference_labels();
    let later = Array2::from_shape_fn((20, 20), |(_, c)| if c < 5 { FOREST } else { ARTIFICIAL });
    let mut record = BTreeMap::new();
    record.insert(2000, Raster::from_array(grid.clone(), later).unwrap());
    let inputs = PipelineInputs {
        grid: &grid,
        observations: &observations,
        topography: &topography,
        reference_labels: &labels,
        prior: None,
        label_record: &record,
    };
    let pipeline = Pipeline::new(config(&[(1975, Sensor::Landsat2Mss), (1990, Sensor::Landsat5Tm)])).unwrap();
    let outputs = pipeline.run(Stage::Transitions, &inputs).unwrap();

    assert!(outputs.composites.is_empty());
    let report = &outputs.transitions[&(1990, 2000)].as_ref().unwrap().data;
    // columns 5..10 turned from forest to artificial
    assert_eq!(report.pixel_count(FOREST, ARTIFICIAL), 100);
    assert_eq!(report.improbable_pixels, 100);
    assert!((report.improbable_pct.unwrap() - 25.0).abs() < 1e-12);
}
