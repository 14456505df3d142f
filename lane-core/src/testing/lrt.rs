//! Likelihood ratio test between nested NB fits.

use super::{TestKind, TestResult};
use crate::backend::FittedModel;

/// 2 (l_alt - l_null), clamped at zero, on `p_alt - p_null` degrees of freedom.
pub fn likelihood_ratio_test(alt: &FittedModel, null: &FittedModel) -> TestResult {
    let df = alt.n_params().saturating_sub(null.n_params());
    match (alt.log_likelihood, null.log_likelihood) {
        (Some(la), Some(ln)) => TestResult::from_statistic(TestKind::Lrt, 2.0 * (la - ln), df),
        _ => TestResult::undefined(TestKind::Lrt, df, "log-likelihood unavailable for this backend"),
    }
}
