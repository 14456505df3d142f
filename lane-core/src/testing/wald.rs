//! Wald test on a block of coefficients.

use lane_linalg::decomposition::{pseudo_inverse, CholeskyDecomp};

use super::{TestKind, TestResult};
use crate::backend::FittedModel;

/// b' V_bb^{-1} b over the coefficients in `idx`. V is the sandwich
/// covariance (bias corrected as configured) when the fit has one, the
/// model-based covariance otherwise.
pub fn wald_test(fit: &FittedModel, idx: &[usize]) -> TestResult {
    let df = idx.len();
    if df == 0 {
        return TestResult::no_terms(TestKind::Wald);
    }
    let b: Vec<f64> = idx.iter().map(|&i| fit.coefficients[i]).collect();
    let mut v = fit.inference_cov().principal(idx);
    v.symmetrize();
    if !v.is_finite() || b.iter().any(|x| !x.is_finite()) {
        return TestResult::undefined(TestKind::Wald, df, "non-finite coefficients or covariance");
    }

    match CholeskyDecomp::new(&v) {
        Ok(chol) => {
            let stat: f64 = b.iter().zip(chol.solve(&b)).map(|(x, y)| x * y).sum();
            TestResult::from_statistic(TestKind::Wald, stat, df)
        }
        Err(_) => match pseudo_inverse(&v, 1e-10) {
            Ok(pinv) => TestResult::from_statistic(TestKind::Wald, pinv.quad_form(&b), df)
                .with_note("covariance singular; pseudo-inverse used"),
            Err(e) => TestResult::undefined(TestKind::Wald, df, format!("covariance not invertible: {}", e)),
        },
    }
}
