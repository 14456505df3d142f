//! End-to-end tests of `test_dynamic` on simulated count data.

use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{Gamma, Normal, Poisson};

use lane_core::backend::{BackendKind, CorrelationStructure};
use lane_core::data::{CountSource, InMemoryCounts, PseudotimeTable};
use lane_core::dynamic::{test_dynamic, DynamicTestConfig, DynamicTestInput, DynamicTestResults, UnitState, UnitStatus};
use lane_core::error::InputError;
use lane_core::testing::{GeeTest, TestKind};

/// NB2 draws via the gamma-Poisson mixture.
fn nb_counts(mu: &[f64], theta: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    mu.iter()
        .map(|&m| {
            let g = Gamma::new(theta, theta / m).unwrap().sample(rng);
            Poisson::new(g.max(1e-12)).unwrap().sample(rng)
        })
        .collect()
}

fn cell_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cell{:03}", i)).collect()
}

/// Timing fields differ between otherwise identical runs.
fn without_timing(mut results: DynamicTestResults) -> DynamicTestResults {
    results.elapsed_seconds = 0.0;
    for g in &mut results.genes {
        for r in &mut g.lineages {
            r.fit_seconds = 0.0;
        }
    }
    results
}

/// Two lineages over 50 cells: cells 0..25 on A, 25..50 on B.
fn two_lineage_table() -> PseudotimeTable {
    let a: Vec<Option<f64>> = (0..50).map(|i| (i < 25).then(|| i as f64 / 24.0)).collect();
    let b: Vec<Option<f64>> = (0..50).map(|i| (i >= 25).then(|| (i - 25) as f64 / 24.0)).collect();
    PseudotimeTable::new(cell_ids(50), vec![a, b]).unwrap()
}

/// Several genes on one 80-cell lineage, some dynamic, one flat.
fn simulated_panel(seed: u64) -> (InMemoryCounts, PseudotimeTable) {
    let n = 80;
    let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shapes: Vec<Box<dyn Fn(f64) -> f64>> = vec![
        Box::new(|x: f64| (1.0 + 2.5 * x).exp()),
        Box::new(|x: f64| (1.0 + 3.0 * (x - 0.5).max(0.0)).exp()),
        Box::new(|_: f64| 6.0),
        Box::new(|x: f64| (2.5 - 2.0 * x).exp()),
    ];
    let rows: Vec<Vec<f64>> = shapes
        .iter()
        .map(|f| {
            let mu: Vec<f64> = t.iter().map(|&x| f(x)).collect();
            nb_counts(&mu, 8.0, &mut rng)
        })
        .collect();
    let genes = vec!["up".into(), "late".into(), "flat".into(), "down".into()];
    let counts = InMemoryCounts::from_rows(genes, rows).unwrap();
    let table = PseudotimeTable::new(cell_ids(n), vec![t.into_iter().map(Some).collect()]).unwrap();
    (counts, table)
}

/// Subjects in sorted order, `per` cells each, pseudotime rising within
/// every subject, and a random intercept per subject.
fn clustered_panel(n_subjects: usize, per: usize, seed: u64) -> (InMemoryCounts, PseudotimeTable, Vec<String>) {
    let n = n_subjects * per;
    let t: Vec<f64> = (0..n).map(|i| (i % per) as f64 / (per - 1) as f64).collect();
    let subjects: Vec<String> = (0..n).map(|i| format!("subj{:02}", i / per)).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.3).unwrap();
    let b: Vec<f64> = (0..n_subjects).map(|_| normal.sample(&mut rng)).collect();
    let mu_rising: Vec<f64> = (0..n).map(|i| (1.0 + 2.0 * t[i] + b[i / per]).exp()).collect();
    let mu_flat: Vec<f64> = (0..n).map(|i| (1.5 + b[i / per]).exp()).collect();
    let rows = vec![nb_counts(&mu_rising, 10.0, &mut rng), nb_counts(&mu_flat, 10.0, &mut rng)];
    let counts = InMemoryCounts::from_rows(vec!["rising".into(), "flat".into()], rows).unwrap();
    let table = PseudotimeTable::new(cell_ids(n), vec![t.into_iter().map(Some).collect()]).unwrap();
    (counts, table, subjects)
}

fn input<'a>(counts: &'a InMemoryCounts, table: &'a PseudotimeTable) -> DynamicTestInput<'a> {
    DynamicTestInput {
        counts,
        pseudotime: table,
        offset: None,
        subject_ids: None,
        genes: None,
    }
}

#[test]
fn test_two_lineage_example() {
    let rising: Vec<f64> = (0..25).map(|i| (1.0 + 0.12 * i as f64).exp().round()).collect();
    let row: Vec<f64> = rising.into_iter().chain(std::iter::repeat(5.0).take(25)).collect();
    let counts = InMemoryCounts::from_rows(vec!["g1".into()], vec![row]).unwrap();
    let table = two_lineage_table();
    let config = DynamicTestConfig {
        backend: BackendKind::Glm,
        max_terms: 5,
        ..Default::default()
    };

    let results = test_dynamic(input(&counts, &table), &config).unwrap();
    assert_eq!(results.lineage_labels, vec!["Lineage_A", "Lineage_B"]);
    assert_eq!(results.test, TestKind::Lrt);

    let a = results.get("g1", "Lineage_A").unwrap();
    assert_eq!(a.status, UnitStatus::Ok);
    assert_eq!(a.n_cells, 25);
    assert!(a.p_value().unwrap() < 0.01, "{:?}", a.test);

    let b = results.get("g1", "Lineage_B").unwrap();
    assert!(b.p_value().unwrap() > 0.3, "{:?}", b.test);
}

#[test]
fn test_repeated_runs_are_identical() {
    let (counts, table) = simulated_panel(11);
    let config = DynamicTestConfig {
        approx_knot: true,
        seed: 5,
        ..Default::default()
    };
    let first = without_timing(test_dynamic(input(&counts, &table), &config).unwrap());
    let second = without_timing(test_dynamic(input(&counts, &table), &config).unwrap());
    assert_eq!(first, second);
}

#[test]
fn test_worker_count_does_not_change_results() {
    let (counts, table) = simulated_panel(23);
    let sequential = DynamicTestConfig {
        approx_knot: true,
        n_workers: 1,
        ..Default::default()
    };
    let parallel = DynamicTestConfig {
        n_workers: 3,
        ..sequential.clone()
    };
    let a = without_timing(test_dynamic(input(&counts, &table), &sequential).unwrap());
    let b = without_timing(test_dynamic(input(&counts, &table), &parallel).unwrap());
    assert_eq!(a, b);
    let order: Vec<&str> = b.genes.iter().map(|g| g.gene.as_str()).collect();
    assert_eq!(order, vec!["up", "late", "flat", "down"]);
}

#[test]
fn test_failing_gene_is_isolated() {
    let (counts, table) = simulated_panel(3);
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let all: Vec<usize> = (0..80).collect();
    for g in 0..counts.n_genes() {
        let mut row = Vec::new();
        counts.read_cells(g, &all, &mut row).unwrap();
        rows.push(row);
    }
    rows.insert(1, vec![0.0; 80]);
    let genes = vec!["up".into(), "zero".into(), "late".into(), "flat".into(), "down".into()];
    let with_zero = InMemoryCounts::from_rows(genes, rows).unwrap();

    let config = DynamicTestConfig {
        n_workers: 2,
        ..Default::default()
    };
    let results = test_dynamic(input(&with_zero, &table), &config).unwrap();
    assert_eq!(results.genes.len(), 5);

    let zero = results.get("zero", "Lineage_A").unwrap();
    assert_eq!(zero.status, UnitStatus::FitFailed);
    assert_eq!(zero.state, UnitState::Error);
    assert_eq!(zero.failed_in, Some(UnitState::FittingAlt));
    assert!(zero.test.statistic.is_none() && zero.p_adj.is_none());

    for gene in ["up", "late", "down"] {
        let r = results.get(gene, "Lineage_A").unwrap();
        assert_eq!(r.status, UnitStatus::Ok, "{}: {:?}", gene, r.notes);
        assert!(r.p_value().unwrap() < 1e-3, "{}: {:?}", gene, r.test);
        assert!(r.p_adj.unwrap() >= r.p_value().unwrap());
    }
}

#[test]
fn test_df_and_model_size() {
    let (counts, table) = simulated_panel(41);
    for max_terms in [1, 3, 5] {
        let config = DynamicTestConfig {
            max_terms,
            ..Default::default()
        };
        let results = test_dynamic(input(&counts, &table), &config).unwrap();
        for r in results.records().filter(|r| r.status == UnitStatus::Ok) {
            let alt = r.alt.as_ref().unwrap();
            assert!(alt.n_terms() <= max_terms);
            assert_eq!(r.test.df, alt.n_terms());
            assert_eq!(alt.n_params, alt.n_terms() + 1);
            assert!(alt.selected_gcv.unwrap() <= alt.forward_gcv.unwrap() + 1e-12);
        }
    }
}

#[test]
fn test_flat_gene_is_not_called_dynamic() {
    let (counts, table) = simulated_panel(77);
    let genes = vec!["flat".to_string()];
    let results = test_dynamic(
        DynamicTestInput {
            genes: Some(&genes),
            ..input(&counts, &table)
        },
        &DynamicTestConfig::default(),
    )
    .unwrap();
    assert_eq!(results.genes.len(), 1);
    let r = results.get("flat", "Lineage_A").unwrap();
    assert!(r.p_value().unwrap() > 0.001, "{:?}", r.test);
}

/// 100 flat NB2 series (mean 6, theta 5) over 20 subjects x 5 cells.
fn flat_null_panel(seed: u64) -> (InMemoryCounts, PseudotimeTable, Vec<String>) {
    let (n_genes, n) = (100, 100);
    let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let subjects: Vec<String> = (0..n).map(|i| format!("subj{:02}", i / 5)).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mu = vec![6.0; n];
    let rows: Vec<Vec<f64>> = (0..n_genes).map(|_| nb_counts(&mu, 5.0, &mut rng)).collect();
    let genes: Vec<String> = (0..n_genes).map(|g| format!("null{:03}", g)).collect();
    let counts = InMemoryCounts::from_rows(genes, rows).unwrap();
    let table = PseudotimeTable::new(cell_ids(n), vec![t.into_iter().map(Some).collect()]).unwrap();
    (counts, table, subjects)
}

#[test]
fn test_flat_series_keep_nominal_level() {
    let (counts, table, subjects) = flat_null_panel(2024);
    let base = DynamicTestConfig {
        n_workers: 4,
        ..Default::default()
    };
    let configs = [
        DynamicTestConfig {
            backend: BackendKind::Glm,
            ..base.clone()
        },
        DynamicTestConfig {
            backend: BackendKind::Gee,
            ..base.clone()
        },
        DynamicTestConfig {
            backend: BackendKind::Gee,
            gee_test: GeeTest::Score,
            ..base.clone()
        },
        DynamicTestConfig {
            backend: BackendKind::Glmm,
            ..base.clone()
        },
    ];
    // Binomial(100, 0.05): mean 5, sd 2.18; allow three sd.
    let limit = 5.0 + 3.0 * (100.0f64 * 0.05 * 0.95).sqrt();
    for config in &configs {
        let results = test_dynamic(
            DynamicTestInput {
                subject_ids: Some(&subjects),
                ..input(&counts, &table)
            },
            config,
        )
        .unwrap();
        let tested: Vec<f64> = results.records().filter_map(|r| r.p_value()).collect();
        assert!(tested.len() >= 80, "{:?}/{}: only {} tests defined", config.backend, results.test, tested.len());
        let rejected = tested.iter().filter(|&&p| p < 0.05).count();
        assert!(
            (rejected as f64) <= limit,
            "{:?}/{}: {} of {} flat series rejected",
            config.backend,
            results.test,
            rejected,
            tested.len()
        );
        let empty = results
            .records()
            .filter_map(|r| r.alt.as_ref())
            .filter(|alt| alt.n_terms() == 0)
            .count();
        assert!(empty > 0, "{:?}/{}: every fit kept a basis term", config.backend, results.test);
    }
}

#[test]
fn test_gee_wald_and_score() {
    let (counts, table, subjects) = clustered_panel(30, 4, 9);
    let base = DynamicTestConfig {
        backend: BackendKind::Gee,
        cor_structure: CorrelationStructure::Exchangeable,
        max_terms: 3,
        ..Default::default()
    };
    let run = |config: &DynamicTestConfig| {
        test_dynamic(
            DynamicTestInput {
                subject_ids: Some(&subjects),
                ..input(&counts, &table)
            },
            config,
        )
        .unwrap()
    };

    let wald = run(&base);
    assert_eq!(wald.test, TestKind::Wald);
    let r = wald.get("rising", "Lineage_A").unwrap();
    assert_eq!(r.status, UnitStatus::Ok, "{:?}", r.notes);
    assert!(r.p_value().unwrap() < 0.01, "{:?}", r.test);
    let alt = r.alt.as_ref().unwrap();
    assert!(alt.alpha.is_some() && alt.log_likelihood.is_none());

    let score = run(&DynamicTestConfig {
        gee_test: GeeTest::Score,
        ..base.clone()
    });
    assert_eq!(score.test, TestKind::Score);
    for r in score.records() {
        if let Some(p) = r.p_value() {
            assert!((0.0..=1.0).contains(&p));
        }
    }
}

#[test]
fn test_glmm_adaptive_and_fixed_knots() {
    let (counts, table, subjects) = clustered_panel(20, 6, 17);
    let base = DynamicTestConfig {
        backend: BackendKind::Glmm,
        max_terms: 3,
        ..Default::default()
    };
    for glmm_adaptive in [true, false] {
        let config = DynamicTestConfig {
            glmm_adaptive,
            ..base.clone()
        };
        let results = test_dynamic(
            DynamicTestInput {
                subject_ids: Some(&subjects),
                ..input(&counts, &table)
            },
            &config,
        )
        .unwrap();
        assert_eq!(results.test, TestKind::Lrt);
        let r = results.get("rising", "Lineage_A").unwrap();
        assert_eq!(r.status, UnitStatus::Ok, "{:?}", r.notes);
        assert!(r.p_value().unwrap() < 0.01, "{:?}", r.test);
        let alt = r.alt.as_ref().unwrap();
        assert!(alt.sigma2.unwrap() > 0.0);
        assert!(alt.n_terms() <= 3);
        for r in results.records() {
            if let Some(p) = r.p_value() {
                assert!((0.0..=1.0).contains(&p));
            }
        }
    }
}

#[test]
fn test_input_errors_stop_before_dispatch() {
    let (counts, table, mut subjects) = clustered_panel(5, 4, 1);
    let gee = DynamicTestConfig {
        backend: BackendKind::Gee,
        ..Default::default()
    };

    assert!(matches!(
        test_dynamic(input(&counts, &table), &gee),
        Err(InputError::MissingSubjectIds { .. })
    ));

    subjects.swap(0, 19);
    assert!(matches!(
        test_dynamic(
            DynamicTestInput {
                subject_ids: Some(&subjects),
                ..input(&counts, &table)
            },
            &gee
        ),
        Err(InputError::UnsortedSubjectIds { .. })
    ));

    let short = PseudotimeTable::new(cell_ids(10), vec![vec![Some(0.5); 10]]).unwrap();
    assert!(matches!(
        test_dynamic(input(&counts, &short), &DynamicTestConfig::default()),
        Err(InputError::LengthMismatch { .. })
    ));

    let offset = vec![f64::NAN; 20];
    assert!(matches!(
        test_dynamic(
            DynamicTestInput {
                offset: Some(&offset),
                ..input(&counts, &table)
            },
            &DynamicTestConfig::default()
        ),
        Err(InputError::InvalidOffset { cell: 0, .. })
    ));

    let fractional = InMemoryCounts::from_rows(vec!["g".into()], vec![vec![1.5; 20]]).unwrap();
    assert!(matches!(
        test_dynamic(input(&fractional, &table), &DynamicTestConfig::default()),
        Err(InputError::InvalidCount { .. })
    ));

    let bad_workers = DynamicTestConfig {
        n_workers: 0,
        ..Default::default()
    };
    assert!(matches!(
        test_dynamic(input(&counts, &table), &bad_workers),
        Err(InputError::OutOfRange { option: "n_workers", .. })
    ));
}

#[test]
fn test_offset_absorbs_library_size() {
    // Counts proportional to a cell-level size factor that rises along
    // pseudotime: with the offset the trend disappears.
    let n = 60;
    let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let size: Vec<f64> = t.iter().map(|&x| 1.0 + 2.0 * x).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let mu: Vec<f64> = size.iter().map(|s| 8.0 * s).collect();
    let counts = InMemoryCounts::from_rows(vec!["g".into()], vec![nb_counts(&mu, 20.0, &mut rng)]).unwrap();
    let table = PseudotimeTable::new(cell_ids(n), vec![t.into_iter().map(Some).collect()]).unwrap();
    let offset: Vec<f64> = size.iter().map(|s| s.ln()).collect();

    let config = DynamicTestConfig::default();
    let raw = test_dynamic(input(&counts, &table), &config).unwrap();
    let adjusted = test_dynamic(
        DynamicTestInput {
            offset: Some(&offset),
            ..input(&counts, &table)
        },
        &config,
    )
    .unwrap();
    let p_raw = raw.get("g", "Lineage_A").unwrap().p_value().unwrap();
    let p_adj = adjusted.get("g", "Lineage_A").unwrap().p_value().unwrap();
    assert!(p_raw < 1e-4, "raw p = {}", p_raw);
    assert!(p_adj > p_raw);
}
