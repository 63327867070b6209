use approx::assert_abs_diff_eq;
use backcast::core::fusion::{argmax, fuse_pixel, FusionParams, FusionRule};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_distribution(rng: &mut StdRng, k: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..k).map(|_| rng.gen_range(0.0..1.0)).collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

#[test]
fn test_worked_scenario() {
    let fused = fuse_pixel(FusionRule::Linear, 0.7, &[0.8, 0.2], Some(&[0.3, 0.7]));
    assert_abs_diff_eq!(fused[0], 0.65, epsilon = 1e-12);
    assert_abs_diff_eq!(fused[1], 0.35, epsilon = 1e-12);
    assert_eq!(argmax(&[1, 2], &fused), Some((1, fused[0])));
}

#[test]
fn test_fused_distribution_sums_to_one() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(2024);
    for step in 0..=10 {
        let alpha = step as f64 / 10.0;
        for _ in 0..50 {
            let k = rng.gen_range(2..8);
            let rf = random_distribution(&mut rng, k);
            // trend models drift, so the prior need not sum to one
            let prior: Vec<f64> = random_distribution(&mut rng, k).iter().map(|p| p * 1.3).collect();
            for rule in [FusionRule::Linear, FusionRule::Reinforcement] {
                let with_prior = fuse_pixel(rule, alpha, &rf, Some(&prior));
                assert_abs_diff_eq!(with_prior.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
                assert!(with_prior.iter().all(|p| *p >= 0.0));

                let without = fuse_pixel(rule, alpha, &rf, None);
                for (a, b) in without.iter().zip(&rf) {
                    assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
                }
            }
        }
    }
}

#[test]
fn test_alpha_extremes() {
    let rf = [0.6, 0.3, 0.1];
    let prior = [0.1, 0.1, 0.8];
    let only_rf = fuse_pixel(FusionRule::Linear, 1.0, &rf, Some(&prior));
    let only_prior = fuse_pixel(FusionRule::Linear, 0.0, &rf, Some(&prior));
    for (a, b) in only_rf.iter().zip(&rf) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
    for (a, b) in only_prior.iter().zip(&prior) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_nan_prior_is_treated_as_absent() {
    let rf = [0.4, 0.6];
    let fused = fuse_pixel(FusionRule::Linear, 0.5, &rf, Some(&[f64::NAN, f64::NAN]));
    assert_eq!(fused, rf.to_vec());
}

#[test]
fn test_ties_go_to_lowest_class() {
    assert_eq!(argmax(&[2, 5, 7], &[0.25, 0.5, 0.25 + 0.25]), Some((5, 0.5)));
    assert_eq!(argmax(&[2, 5], &[0.5, f64::NAN]), None);
}

#[test]
fn test_alpha_outside_unit_interval_rejected() {
    let params = FusionParams { prior_alpha: 1.2, rule: FusionRule::Linear };
    assert_eq!(params.validate().unwrap_err().exit_code(), 1);
    assert!(FusionParams::default().validate().is_ok());
}
