//! Property-based tests using proptest.
//!
//! Invariants that must hold for any valid input:
//!   - p-values in [0, 1], adjusted p-values never below raw ones
//!   - selected models respect the term budget and never raise GCV
//!   - hinge columns are non-negative and vanish on one side of the knot

use proptest::prelude::*;
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{Gamma, Poisson};

use lane_core::backend::Backend;
use lane_core::data::Series;
use lane_core::marge::basis::{design_matrix, BasisTerm, HingeDirection};
use lane_core::marge::{fit_marge, MargeConfig};
use lane_core::testing::chi_square_sf;
use lane_core::util::math::benjamini_hochberg;

fn nb_series(n: usize, slope: f64, theta: f64, seed: u64) -> Series {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let y: Vec<f64> = t
        .iter()
        .map(|&x| {
            let m = (1.2 + slope * x).exp();
            let g = Gamma::new(theta, theta / m).unwrap().sample(&mut rng);
            Poisson::new(g.max(1e-12)).unwrap().sample(&mut rng)
        })
        .collect();
    Series::new(y, t, None, None).unwrap()
}

// ---------------------------------------------------------------------------
// 1. Search results respect the budget and the GCV ordering
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_marge_respects_budget(
        n in 30usize..70,
        slope in -2.0f64..2.0,
        max_terms in 1usize..6,
        seed in 0u64..1000,
    ) {
        let series = nb_series(n, slope, 6.0, seed);
        prop_assume!(series.response.iter().any(|&y| y > 0.0));
        let config = MargeConfig { max_terms, ..Default::default() };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        if let Ok(model) = fit_marge(&series, &Backend::default(), &config, &mut rng) {
            prop_assert!(model.n_terms() <= max_terms);
            prop_assert!(model.forward_terms <= max_terms);
            prop_assert!(model.n_terms() <= model.forward_terms.max(1));
            prop_assert!(model.selected_gcv <= model.forward_gcv + 1e-12);
            prop_assert_eq!(model.design.ncols(), model.n_terms() + 1);
            prop_assert!(model.fit.theta > 0.0);
        }
    }
}

// ---------------------------------------------------------------------------
// 2. p-values stay in the unit interval
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_chi_square_sf_in_unit_interval(stat in 0.0f64..500.0, df in 0usize..12) {
        let p = chi_square_sf(stat, df).unwrap();
        prop_assert!((0.0..=1.0).contains(&p), "p = {}", p);
    }

    #[test]
    fn prop_bh_bounds(ps in prop::collection::vec(prop::option::of(0.0f64..=1.0), 1..40)) {
        let adj = benjamini_hochberg(&ps);
        prop_assert_eq!(adj.len(), ps.len());
        for (p, a) in ps.iter().zip(adj.iter()) {
            match (p, a) {
                (Some(p), Some(a)) => {
                    prop_assert!(*a >= *p - 1e-15);
                    prop_assert!(*a <= 1.0);
                }
                (None, None) => {}
                _ => prop_assert!(false, "missingness changed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Hinge columns
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_hinge_columns(
        xs in prop::collection::vec(-5.0f64..5.0, 2..50),
        knot in -5.0f64..5.0,
    ) {
        let terms = [
            BasisTerm::root(knot, HingeDirection::Plus),
            BasisTerm::root(knot, HingeDirection::Minus),
        ];
        let design = design_matrix(&xs, &terms);
        for (i, &x) in xs.iter().enumerate() {
            let plus = design.get(i, 1);
            let minus = design.get(i, 2);
            prop_assert_eq!(design.get(i, 0), 1.0);
            prop_assert!(plus >= 0.0 && minus >= 0.0);
            prop_assert!(plus == 0.0 || minus == 0.0);
            prop_assert!((plus - minus - (x - knot)).abs() < 1e-12);
        }
    }
}
