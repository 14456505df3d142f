//! Negative binomial GEE with a working correlation over subjects.
//!
//! Fisher scoring of U(beta) = sum_i D_i' V_i^{-1} (y_i - mu_i) with
//! D_i = diag(mu_i) X_i and V_i = phi A_i^{1/2} R(alpha) A_i^{1/2},
//! A_i = diag(mu + mu^2/theta). Theta comes from an independence NB GLM
//! fit; alpha and phi are moment estimates refreshed every iteration.

use std::ops::Range;

use lane_linalg::decomposition::{inverse_sqrt_pd, sqrt_psd, CholeskyDecomp};
use lane_linalg::dense::DenseMatrix;
use tracing::{debug, warn};

use super::correlation::{BiasCorrection, CorrelationStructure};
use super::family::NegBinomial;
use super::glm::{covariance_from_xtwx, fit_nb_glm, linear_predictor, GlmConfig};
use super::{BackendAux, FitFailure, FittedModel};
use crate::data::{Series, SubjectGroups};

/// Configuration for NB GEE fitting.
#[derive(Debug, Clone)]
pub struct GeeConfig {
    pub correlation: CorrelationStructure,
    pub bias_correction: BiasCorrection,
    /// Compute the sandwich covariance.
    pub robust: bool,
    pub max_iter: usize,
    /// Convergence tolerance on the largest coefficient update.
    pub tol: f64,
    /// Settings for the initial independence GLM fit.
    pub glm: GlmConfig,
}

impl Default for GeeConfig {
    fn default() -> Self {
        Self {
            correlation: CorrelationStructure::default(),
            bias_correction: BiasCorrection::default(),
            robust: true,
            max_iter: 25,
            tol: 1e-6,
            glm: GlmConfig::default(),
        }
    }
}

/// Per-subject pieces of the estimating equations.
pub(crate) struct ClusterBlock {
    /// d mu / d beta, m x p.
    pub d: DenseMatrix,
    /// Working covariance V_i.
    pub v: DenseMatrix,
    pub v_inv: DenseMatrix,
    /// y_i - mu_i.
    pub resid: Vec<f64>,
}

impl ClusterBlock {
    /// D' V^{-1}, p x m.
    pub fn dt_vinv(&self) -> DenseMatrix {
        self.d.transpose().mat_mul(&self.v_inv)
    }
}

/// Working parameters shared by every cluster.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkingModel {
    pub family: NegBinomial,
    pub correlation: CorrelationStructure,
    pub alpha: f64,
    pub phi: f64,
}

pub(crate) fn cluster_block(
    x: &DenseMatrix,
    range: Range<usize>,
    y: &[f64],
    mu: &[f64],
    model: &WorkingModel,
) -> ClusterBlock {
    let m = range.len();
    let p = x.ncols();
    let start = range.start;
    let mut d = x.block(range.clone(), 0..p);
    for i in 0..m {
        for j in 0..p {
            d.set(i, j, d.get(i, j) * mu[start + i]);
        }
    }
    let sd: Vec<f64> = range.clone().map(|i| model.family.variance(mu[i]).sqrt()).collect();
    let r = model.correlation.matrix(m, model.alpha);
    let r_inv = model.correlation.inverse(m, model.alpha);
    let mut v = DenseMatrix::zeros(m, m);
    let mut v_inv = DenseMatrix::zeros(m, m);
    for i in 0..m {
        for j in 0..m {
            v.set(i, j, model.phi * sd[i] * r.get(i, j) * sd[j]);
            v_inv.set(i, j, r_inv.get(i, j) / (model.phi * sd[i] * sd[j]));
        }
    }
    let resid = range.map(|i| y[i] - mu[i]).collect();
    ClusterBlock { d, v, v_inv, resid }
}

pub(crate) fn cluster_blocks(
    x: &DenseMatrix,
    groups: &SubjectGroups,
    y: &[f64],
    mu: &[f64],
    model: &WorkingModel,
) -> Vec<ClusterBlock> {
    groups
        .ranges()
        .iter()
        .map(|r| cluster_block(x, r.clone(), y, mu, model))
        .collect()
}

/// Pearson residuals and the scale estimate phi = sum(e^2) / (N - p).
fn pearson_and_phi(y: &[f64], mu: &[f64], family: &NegBinomial, p: usize) -> (Vec<f64>, f64) {
    let e: Vec<f64> = y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| (yi - mi) / family.variance(mi).sqrt())
        .collect();
    let dof = (y.len().saturating_sub(p)).max(1) as f64;
    let phi = e.iter().map(|v| v * v).sum::<f64>() / dof;
    (e, phi.max(1e-8))
}

fn refresh_working_model(
    y: &[f64],
    mu: &[f64],
    family: NegBinomial,
    correlation: CorrelationStructure,
    groups: &SubjectGroups,
    p: usize,
) -> WorkingModel {
    let (e, phi) = pearson_and_phi(y, mu, &family, p);
    let alpha = correlation.estimate_alpha(&e, groups.ranges(), phi, p);
    WorkingModel {
        family,
        correlation,
        alpha,
        phi,
    }
}

/// Sum of D'V^{-1}D and D'V^{-1}r over clusters.
fn information_and_score(blocks: &[ClusterBlock], p: usize) -> (DenseMatrix, Vec<f64>) {
    let mut info = DenseMatrix::zeros(p, p);
    let mut score = vec![0.0; p];
    for b in blocks {
        let dtv = b.dt_vinv();
        info = info.add(&dtv.mat_mul(&b.d));
        for (s, v) in score.iter_mut().zip(dtv.mat_vec(&b.resid)) {
            *s += v;
        }
    }
    info.symmetrize();
    (info, score)
}

/// Kauermann-Carroll residuals L (I - S)^{-1/2} L^{-1} r with L = V^{1/2}
/// and S = L^{-1} D B^{-1} D' L^{-1}.
fn kc_residuals(block: &ClusterBlock, b_inv: &DenseMatrix) -> Option<Vec<f64>> {
    let l = sqrt_psd(&block.v).ok()?;
    let l_inv = inverse_sqrt_pd(&block.v).ok()?;
    let ld = l_inv.mat_mul(&block.d);
    let s = ld.mat_mul(b_inv).mat_mul(&ld.transpose());
    let mut i_minus_s = DenseMatrix::identity(s.nrows()).sub(&s);
    i_minus_s.symmetrize();
    let adj = inverse_sqrt_pd(&i_minus_s).ok()?;
    Some(l.mat_mul(&adj).mat_mul(&l_inv).mat_vec(&block.resid))
}

/// Sandwich covariance B^{-1} M B^{-1}, optionally bias corrected.
pub(crate) fn sandwich(
    blocks: &[ClusterBlock],
    b_inv: &DenseMatrix,
    correction: BiasCorrection,
) -> DenseMatrix {
    let p = b_inv.nrows();
    let mut meat = DenseMatrix::zeros(p, p);
    let mut kc_fallbacks = 0;
    for b in blocks {
        let resid = match correction {
            BiasCorrection::KauermannCarroll => kc_residuals(b, b_inv).unwrap_or_else(|| {
                kc_fallbacks += 1;
                b.resid.clone()
            }),
            _ => b.resid.clone(),
        };
        let u = b.dt_vinv().mat_vec(&resid);
        for i in 0..p {
            for j in 0..p {
                meat.set(i, j, meat.get(i, j) + u[i] * u[j]);
            }
        }
    }
    if kc_fallbacks > 0 {
        warn!("{} clusters kept unadjusted residuals (I - H not positive definite)", kc_fallbacks);
    }
    let mut robust = b_inv.mat_mul(&meat).mat_mul(b_inv);
    robust.symmetrize();
    if correction == BiasCorrection::DegreesOfFreedom {
        let k = blocks.len();
        if k > p {
            robust = robust.scale(k as f64 / (k - p) as f64);
        }
    }
    robust
}

/// Fit the NB GEE for one series.
pub fn fit_nb_gee(
    x: &DenseMatrix,
    series: &Series,
    groups: &SubjectGroups,
    config: &GeeConfig,
) -> Result<FittedModel, FitFailure> {
    let y = &series.response;
    let offset = series.offset_or_zero();
    let p = x.ncols();

    let init = fit_nb_glm(x, series, &config.glm)?;
    let family = NegBinomial::new(init.theta);
    let mut beta = init.coefficients;
    let mut mu = init.mu;
    let mut model = refresh_working_model(y, &mu, family, config.correlation, groups, p);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iter {
        iterations = iter + 1;
        let blocks = cluster_blocks(x, groups, y, &mu, &model);
        let (info, score) = information_and_score(&blocks, p);
        let delta = CholeskyDecomp::new(&info)
            .map(|c| c.solve(&score))
            .map_err(|_| FitFailure::Singular)?;

        let mut step = 1.0;
        let mut candidate: Vec<f64>;
        loop {
            candidate = beta.iter().zip(delta.iter()).map(|(b, d)| b + step * d).collect();
            let eta = linear_predictor(x, &candidate, &offset);
            if eta.iter().all(|e| e.is_finite() && *e < 50.0) || step < 1e-3 {
                break;
            }
            step *= 0.5;
        }
        if candidate.iter().any(|b| !b.is_finite()) {
            return Err(FitFailure::NonFinite("coefficients"));
        }
        let max_change = delta.iter().fold(0.0_f64, |m, d| m.max((step * d).abs()));
        beta = candidate;
        mu = family.inv_link(&linear_predictor(x, &beta, &offset));
        model = refresh_working_model(y, &mu, family, config.correlation, groups, p);
        if max_change < config.tol {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!("GEE did not converge after {} iterations", iterations);
    }

    let eta = linear_predictor(x, &beta, &offset);
    let blocks = cluster_blocks(x, groups, y, &mu, &model);
    let (info, _) = information_and_score(&blocks, p);
    let cov_model = covariance_from_xtwx(&info)?;
    let cov_robust = config
        .robust
        .then(|| sandwich(&blocks, &cov_model, config.bias_correction));
    if !cov_model.is_finite() || cov_robust.as_ref().map_or(false, |c| !c.is_finite()) {
        return Err(FitFailure::NonFinite("covariance"));
    }
    debug!(
        "GEE ({}) converged={} after {} iterations: alpha={:.4}, phi={:.4}, theta={:.4}",
        config.correlation, converged, iterations, model.alpha, model.phi, family.theta
    );

    Ok(FittedModel {
        coefficients: beta,
        theta: family.theta,
        deviance: family.deviance(y, &mu),
        weights: family.working_weights(&mu),
        mu,
        eta,
        log_likelihood: None,
        cov_model,
        cov_robust,
        aux: BackendAux::Gee {
            correlation: config.correlation,
            alpha: model.alpha,
            phi: model.phi,
            n_clusters: groups.n_groups(),
        },
        converged,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::nb_draws;

    fn clustered_series(n_subjects: usize, per: usize, seed: u64) -> (DenseMatrix, Series) {
        let n = n_subjects * per;
        let t: Vec<f64> = (0..n).map(|i| (i % per) as f64 / per as f64).collect();
        let mu: Vec<f64> = t.iter().map(|&ti| (1.0 + 1.5 * ti).exp()).collect();
        let y = nb_draws(&mu, 4.0, seed);
        let ids: Vec<String> = (0..n).map(|i| format!("s{:03}", i / per)).collect();
        let groups = SubjectGroups::from_sorted_ids(&ids).unwrap();
        let x = DenseMatrix::intercept(n).with_columns(&[t.clone()]);
        (x, Series::new(y, t, None, Some(groups)).unwrap())
    }

    #[test]
    fn test_gee_recovers_slope() {
        let (x, series) = clustered_series(40, 8, 3);
        let groups = series.groups.clone().unwrap();
        let fit = fit_nb_gee(&x, &series, &groups, &GeeConfig::default()).unwrap();
        assert!(fit.converged);
        assert!((fit.coefficients[1] - 1.5).abs() < 0.4, "{:?}", fit.coefficients);
        assert!(fit.log_likelihood.is_none());
        let robust = fit.cov_robust.as_ref().unwrap();
        assert!(robust.get(1, 1) > 0.0);
        match fit.aux {
            BackendAux::Gee { alpha, n_clusters, .. } => {
                assert!(alpha.abs() <= 0.98);
                assert_eq!(n_clusters, 40);
            }
            _ => panic!("wrong aux"),
        }
    }

    #[test]
    fn test_independence_matches_glm_coefficients() {
        let (x, series) = clustered_series(20, 5, 9);
        let groups = series.groups.clone().unwrap();
        let config = GeeConfig {
            correlation: CorrelationStructure::Independence,
            ..GeeConfig::default()
        };
        let gee = fit_nb_gee(&x, &series, &groups, &config).unwrap();
        let glm = fit_nb_glm(&x, &series, &GlmConfig::default()).unwrap();
        for (a, b) in gee.coefficients.iter().zip(glm.coefficients.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_bias_corrections_inflate_variance() {
        let (x, series) = clustered_series(12, 6, 21);
        let groups = series.groups.clone().unwrap();
        let var = |bc: BiasCorrection| {
            let config = GeeConfig {
                bias_correction: bc,
                ..GeeConfig::default()
            };
            fit_nb_gee(&x, &series, &groups, &config)
                .unwrap()
                .cov_robust
                .unwrap()
                .get(1, 1)
        };
        let plain = var(BiasCorrection::None);
        let df = var(BiasCorrection::DegreesOfFreedom);
        assert!((df / plain - 12.0 / 10.0).abs() < 1e-6);
        let kc = var(BiasCorrection::KauermannCarroll);
        assert!(kc.is_finite() && kc > 0.5 * plain, "kc {} plain {}", kc, plain);
    }
}
