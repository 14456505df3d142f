//! GEE score test of the extra spline columns, evaluated at the null fit.
//!
//! With cluster scores U_i = D_i' V_i^{-1} r_i over the alternative design
//! (null means, null working correlation):
//!   AWA.est = sum D_i' V_i^{-1} D_i        VS.est = sum U_i U_i'
//!   J2      = A21 A11^{-1}
//!   Sigma2  = VS22 - J2 VS12 - VS21 J2' + J2 VS11 J2'
//!   T       = (U2 - J2 U1)' Sigma2^{-1} (U2 - J2 U1)
//! Block 1 holds the null columns, block 2 the extra columns.

use lane_linalg::decomposition::{inverse_or_pinv, CholeskyDecomp, QrDecomp};
use lane_linalg::dense::DenseMatrix;

use super::{TestKind, TestResult};
use crate::backend::family::NegBinomial;
use crate::backend::gee::{cluster_blocks, WorkingModel};
use crate::backend::{BackendAux, FittedModel};
use crate::data::Series;

/// Least-squares coefficients of `y` on `x`, `None` when the probe breaks
/// down (rank deficiency or non-finite coefficients).
pub fn ols_probe(x: &DenseMatrix, y: &[f64]) -> Option<Vec<f64>> {
    let beta = QrDecomp::new(x).ok()?.solve(y);
    beta.iter().all(|b| b.is_finite()).then_some(beta)
}

pub fn gee_score_test(null: &FittedModel, series: &Series, alt_design: &DenseMatrix, null_cols: usize) -> TestResult {
    let p = alt_design.ncols();
    let df = p.saturating_sub(null_cols);
    if df == 0 {
        return TestResult::no_terms(TestKind::Score);
    }
    let (correlation, alpha, phi) = match &null.aux {
        BackendAux::Gee {
            correlation,
            alpha,
            phi,
            ..
        } => (*correlation, *alpha, *phi),
        _ => return TestResult::undefined(TestKind::Score, df, "null model is not a GEE fit"),
    };
    let Some(groups) = series.groups.as_ref() else {
        return TestResult::undefined(TestKind::Score, df, "subject grouping missing");
    };

    let null_design = alt_design.block(0..alt_design.nrows(), 0..null_cols);
    if ols_probe(&null_design, &series.response).is_none() {
        return TestResult::undefined(TestKind::Score, df, "least-squares probe on the null design failed");
    }

    let model = WorkingModel {
        family: NegBinomial::new(null.theta),
        correlation,
        alpha,
        phi,
    };
    let blocks = cluster_blocks(alt_design, groups, &series.response, &null.mu, &model);

    let mut awa = DenseMatrix::zeros(p, p);
    let mut vs = DenseMatrix::zeros(p, p);
    let mut u = vec![0.0; p];
    for b in &blocks {
        let dtv = b.dt_vinv();
        awa = awa.add(&dtv.mat_mul(&b.d));
        let ui = dtv.mat_vec(&b.resid);
        for i in 0..p {
            u[i] += ui[i];
            for j in 0..p {
                vs.set(i, j, vs.get(i, j) + ui[i] * ui[j]);
            }
        }
    }
    awa.symmetrize();

    let (a11_inv, _) = match inverse_or_pinv(&awa.block(0..null_cols, 0..null_cols)) {
        Ok(inv) => inv,
        Err(e) => return TestResult::undefined(TestKind::Score, df, format!("null information singular: {}", e)),
    };
    let a21 = awa.block(null_cols..p, 0..null_cols);
    let j2 = a21.mat_mul(&a11_inv);
    let s11 = vs.block(0..null_cols, 0..null_cols);
    let s12 = vs.block(0..null_cols, null_cols..p);
    let s21 = vs.block(null_cols..p, 0..null_cols);
    let s22 = vs.block(null_cols..p, null_cols..p);
    let mut sigma2 = s22
        .sub(&j2.mat_mul(&s12))
        .sub(&s21.mat_mul(&j2.transpose()))
        .add(&j2.mat_mul(&s11).mat_mul(&j2.transpose()));
    sigma2.symmetrize();

    let j2u1 = j2.mat_vec(&u[..null_cols]);
    let u2: Vec<f64> = u[null_cols..].iter().zip(j2u1.iter()).map(|(a, b)| a - b).collect();
    if !sigma2.is_finite() || u2.iter().any(|v| !v.is_finite()) {
        return TestResult::undefined(TestKind::Score, df, "non-finite score components");
    }

    match CholeskyDecomp::new(&sigma2) {
        Ok(chol) => {
            let stat: f64 = u2.iter().zip(chol.solve(&u2)).map(|(a, b)| a * b).sum();
            TestResult::from_statistic(TestKind::Score, stat, df)
        }
        Err(_) => match inverse_or_pinv(&sigma2) {
            Ok((inv, _)) => TestResult::from_statistic(TestKind::Score, inv.quad_form(&u2), df)
                .with_note("score covariance singular; pseudo-inverse used"),
            Err(e) => TestResult::undefined(TestKind::Score, df, format!("score covariance not invertible: {}", e)),
        },
    }
}
