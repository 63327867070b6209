use backcast::core::fusion::{Backcast, LabelMap};
use backcast::core::postprocess::{
    enforce_mmu, label_components, Connectivity, PostProcessParams, PostProcessor,
};
use backcast::core::provenance::{Artifact, ArtifactKind, Provenance};
use backcast::core::tiling::TileExecutor;
use backcast::types::{ClassId, ClassProbabilities, GeoTransform, GridSpec, Raster, NO_CLASS};
use ndarray::{array, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn noisy_classes(seed: u64, shape: (usize, usize)) -> Array2<ClassId> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn(shape, |_| {
        if rng.gen_bool(0.05) {
            NO_CLASS
        } else {
            rng.gen_range(1..=4)
        }
    })
}

#[test]
fn test_speck_scenario_with_default_settings() {
    let _ = env_logger::builder().is_test(true).try_init();
    let classes = array![[1, 1, 1], [1, 2, 1], [1, 1, 1]];
    let grid = GridSpec::new(3, 3, GeoTransform::north_up(0.0, 90.0, 30.0), "EPSG:32635");
    let labels = LabelMap {
        confidence: Raster::filled(grid.clone(), 0.8),
        classes: Raster::from_array(grid, classes).unwrap(),
    };
    let out = PostProcessor::default().process_labels(&labels, None).unwrap();
    assert!(out.labels.classes.data().iter().all(|&c| c == 1));
    assert!(out.report.converged);
    assert!(out.residual_mask.iter().all(|&r| !r));
}

#[test]
fn test_mmu_invariant_on_noisy_rasters() {
    let _ = env_logger::builder().is_test(true).try_init();
    for (seed, connectivity) in [(1, Connectivity::Four), (2, Connectivity::Eight), (3, Connectivity::Eight)] {
        let original = noisy_classes(seed, (32, 32));
        let params = PostProcessParams {
            min_mapping_unit: 5,
            smoothing_window: 0,
            connectivity,
            max_iterations: 10,
        };

        let mut classes = original.clone();
        let (report, residual) = enforce_mmu(&mut classes, &params, &TileExecutor::default());
        assert!(report.iterations <= params.max_iterations);

        // nodata is never filled and valid pixels never become nodata
        for (a, b) in original.iter().zip(classes.iter()) {
            assert_eq!(*a == NO_CLASS, *b == NO_CLASS);
        }

        // every pixel of a region below the MMU is flagged, nothing else is
        let map = label_components(&classes, connectivity, &TileExecutor::default());
        let mut flagged = 0;
        for ((r, c), &is_residual) in residual.indexed_iter() {
            let small = map
                .component_of(r, c)
                .map_or(false, |id| map.components()[id].size < params.min_mapping_unit);
            assert_eq!(small, is_residual, "pixel ({}, {})", r, c);
            flagged += usize::from(is_residual);
        }
        assert_eq!(flagged, report.residual_pixels);
        assert_eq!(report.converged, report.residual_components == 0);

        // row tiling does not change the outcome
        let mut tiled = original.clone();
        let (tiled_report, _) = enforce_mmu(&mut tiled, &params, &TileExecutor::new(3));
        assert_eq!(tiled, classes);
        assert_eq!(tiled_report, report);
    }
}

#[test]
fn test_bounded_iterations_terminate_on_checkerboard() {
    let _ = env_logger::builder().is_test(true).try_init();
    let checker = Array2::from_shape_fn((16, 16), |(r, c)| if (r + c) % 2 == 0 { 1 } else { 2 });
    let params = PostProcessParams {
        min_mapping_unit: 9,
        smoothing_window: 0,
        connectivity: Connectivity::Four,
        max_iterations: 3,
    };
    let mut classes = checker.clone();
    let (report, _) = enforce_mmu(&mut classes, &params, &TileExecutor::default());
    assert!(report.iterations <= 3);
    assert!(report.reassigned_pixels > 0);
}

fn grid(rows: usize, cols: usize) -> GridSpec {
    GridSpec::new(rows, cols, GeoTransform::north_up(0.0, 30.0 * rows as f64, 30.0), "EPSG:32635")
}

/// Two-class cube with `p1` for class 1 everywhere
fn probabilities(grid: &GridSpec, p1: f64) -> ClassProbabilities {
    let mut data = Array3::from_elem((2, grid.rows, grid.cols), p1);
    data.index_axis_mut(ndarray::Axis(0), 1).fill(1.0 - p1);
    ClassProbabilities::from_array(grid.clone(), vec![1, 2], data).unwrap()
}

fn backcast(classes: Array2<ClassId>, p1: f64) -> Artifact<Backcast> {
    let (rows, cols) = classes.dim();
    let grid = grid(rows, cols);
    let labels = LabelMap {
        confidence: Raster::filled(grid.clone(), 0.9),
        classes: Raster::from_array(grid.clone(), classes).unwrap(),
    };
    let backcast = Backcast {
        labels,
        probabilities: probabilities(&grid, p1),
    };
    Artifact::new(backcast, Provenance::for_year(ArtifactKind::Predictors, 1980))
}

#[test]
fn test_process_reassigns_speck_and_updates_confidence() {
    let _ = env_logger::builder().is_test(true).try_init();
    let input = backcast(array![[1, 1, 1], [1, 2, 1], [1, 1, 1]], 0.3);
    let out = PostProcessor::default().process(&input).unwrap();

    assert_eq!(out.provenance.kind, ArtifactKind::Classification);
    assert_eq!(out.provenance.year, Some(1980));
    assert!(!out.provenance.has_warnings());
    assert_eq!(out.provenance.parameters["min_mapping_unit"], 9);
    assert_eq!(out.data.labels.classes.get(1, 1), 1);
    // the changed pixel takes the fused probability of its new class
    assert!((out.data.labels.confidence.get(1, 1) - 0.3).abs() < 1e-12);
    assert!((out.data.labels.confidence.get(0, 0) - 0.9).abs() < 1e-12);
    assert!(out.data.probabilities.is_some());
}

#[test]
fn test_process_records_residual_regions_in_provenance() {
    let _ = env_logger::builder().is_test(true).try_init();
    // class 2 in the corner is cut off from everything by nodata
    let classes = Array2::from_shape_fn((5, 5), |(r, c)| match (r, c) {
        (0, 0) => 2,
        (0, 1) | (1, 0) | (1, 1) => NO_CLASS,
        _ => 1,
    });
    let out = PostProcessor::default().process(&backcast(classes, 0.6)).unwrap();

    assert!(!out.data.report.converged);
    assert_eq!(out.data.report.residual_components, 1);
    assert_eq!(out.data.report.residual_pixels, 1);
    assert!(out.data.residual_mask[[0, 0]]);
    assert_eq!(out.data.residual_mask.iter().filter(|&&r| r).count(), 1);
    assert_eq!(out.provenance.warnings.len(), 1);
    assert!(out.provenance.warnings[0].contains("minimum mapping unit"));
}

#[test]
fn test_mmu_invariant_with_majority_smoothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    for seed in [4, 5] {
        let original = noisy_classes(seed, (24, 24));
        let grid = grid(24, 24);
        let labels = LabelMap {
            confidence: Raster::filled(grid.clone(), 0.5),
            classes: Raster::from_array(grid, original.clone()).unwrap(),
        };
        let params = PostProcessParams {
            min_mapping_unit: 5,
            ..PostProcessParams::default()
        };
        assert_eq!(params.smoothing_window, 3);

        let out = PostProcessor::new(params).unwrap().process_labels(&labels, None).unwrap();
        let classes = out.labels.classes.data();
        assert!(out.report.smoothed_pixels > 0);
        for (a, b) in original.iter().zip(classes.iter()) {
            assert_eq!(*a == NO_CLASS, *b == NO_CLASS);
        }

        let map = label_components(classes, params.connectivity, &TileExecutor::default());
        for ((r, c), &is_residual) in out.residual_mask.indexed_iter() {
            let small = map
                .component_of(r, c)
                .map_or(false, |id| map.components()[id].size < params.min_mapping_unit);
            assert_eq!(small, is_residual, "pixel ({}, {})", r, c);
        }

        let tiled = PostProcessor::new(params)
            .unwrap()
            .with_executor(TileExecutor::new(5))
            .process_labels(&labels, None)
            .unwrap();
        assert_eq!(tiled.labels.classes.data(), classes);
        assert_eq!(tiled.report, out.report);
    }
}
