//! Negative binomial GLM via IRLS with maximum likelihood theta.
//!
//! Alternates IRLS for the coefficients at fixed theta with a Newton update
//! of theta at fixed means, starting from a Poisson fit.

use lane_linalg::decomposition::CholeskyDecomp;
use lane_linalg::dense::DenseMatrix;
use tracing::{debug, warn};

use super::family::{estimate_theta, NegBinomial};
use super::{BackendAux, FitFailure, FittedModel};
use crate::data::Series;

/// Configuration for NB GLM fitting.
#[derive(Debug, Clone)]
pub struct GlmConfig {
    /// Maximum IRLS iterations per theta value.
    pub max_iter: usize,
    /// Relative deviance change for IRLS convergence.
    pub tol: f64,
    /// Maximum alternations between IRLS and theta.
    pub max_outer: usize,
    /// Newton iterations for theta.
    pub theta_max_iter: usize,
    pub theta_tol: f64,
}

impl Default for GlmConfig {
    fn default() -> Self {
        Self {
            max_iter: 50,
            tol: 1e-8,
            max_outer: 25,
            theta_max_iter: 25,
            theta_tol: 1e-6,
        }
    }
}

/// Result of IRLS at a fixed theta.
#[derive(Debug, Clone)]
pub struct IrlsFit {
    pub beta: Vec<f64>,
    pub eta: Vec<f64>,
    pub mu: Vec<f64>,
    pub weights: Vec<f64>,
    pub deviance: f64,
    /// X'WX at the final weights.
    pub xtwx: DenseMatrix,
    pub iterations: usize,
    pub converged: bool,
}

/// Solve the weighted normal equations, with a small ridge when X'WX is
/// numerically not positive definite.
fn solve_normal_equations(xtwx: &DenseMatrix, xtwz: &[f64]) -> Result<Vec<f64>, FitFailure> {
    match CholeskyDecomp::new(xtwx) {
        Ok(chol) => Ok(chol.solve(xtwz)),
        Err(_) => {
            let p = xtwx.ncols();
            let ridge = 1e-8 * (xtwx.diag().iter().sum::<f64>() / p as f64).max(1e-8);
            let mut reg = xtwx.clone();
            reg.add_to_diag(ridge);
            CholeskyDecomp::new(&reg)
                .map(|chol| chol.solve(xtwz))
                .map_err(|_| FitFailure::Singular)
        }
    }
}

/// IRLS for the NB log-link model at fixed `family.theta`.
///
/// `start_eta` warm-starts the iterations; otherwise mu starts at y + 0.1.
pub fn irls(
    x: &DenseMatrix,
    y: &[f64],
    offset: &[f64],
    family: &NegBinomial,
    start_eta: Option<&[f64]>,
    max_iter: usize,
    tol: f64,
) -> Result<IrlsFit, FitFailure> {
    let p = x.ncols();

    let mut eta: Vec<f64> = match start_eta {
        Some(e) => e.to_vec(),
        None => y.iter().map(|&yi| (yi + 0.1).ln()).collect(),
    };
    let mut mu = family.inv_link(&eta);
    let mut deviance = family.deviance(y, &mu);
    let mut beta: Option<Vec<f64>> = None;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..max_iter {
        iterations = iter + 1;
        let w = family.working_weights(&mu);
        let z = family.working_response(y, &mu, &eta, offset);
        let xtwx = x.xtwx(&w);
        let xtwz = x.xtwv(&w, &z);
        let mut beta_new = solve_normal_equations(&xtwx, &xtwz)?;
        if beta_new.iter().any(|b| !b.is_finite()) {
            return Err(FitFailure::NonFinite("coefficients"));
        }

        let mut eta_new = linear_predictor(x, &beta_new, offset);
        let mut mu_new = family.inv_link(&eta_new);
        let mut dev_new = family.deviance(y, &mu_new);

        // Step halving towards the previous coefficients.
        if let Some(prev) = &beta {
            let mut halvings = 0;
            while (!dev_new.is_finite() || dev_new > deviance * (1.0 + 1e-6) + 1e-8) && halvings < 10 {
                for (b, &bp) in beta_new.iter_mut().zip(prev.iter()) {
                    *b = 0.5 * (*b + bp);
                }
                eta_new = linear_predictor(x, &beta_new, offset);
                mu_new = family.inv_link(&eta_new);
                dev_new = family.deviance(y, &mu_new);
                halvings += 1;
            }
        }
        if !dev_new.is_finite() {
            return Err(FitFailure::NonFinite("deviance"));
        }

        let change = (dev_new - deviance).abs() / (dev_new.abs() + 0.1);
        eta = eta_new;
        mu = mu_new;
        deviance = dev_new;
        beta = Some(beta_new);
        if change < tol && iter > 0 {
            converged = true;
            break;
        }
    }

    let beta = beta.ok_or(FitFailure::Singular)?;
    let weights = family.working_weights(&mu);
    let xtwx = x.xtwx(&weights);
    debug!(
        "IRLS (p={}, theta={:.4}) finished after {} iterations, deviance {:.4}",
        p, family.theta, iterations, deviance
    );
    Ok(IrlsFit {
        beta,
        eta,
        mu,
        weights,
        deviance,
        xtwx,
        iterations,
        converged,
    })
}

pub(crate) fn linear_predictor(x: &DenseMatrix, beta: &[f64], offset: &[f64]) -> Vec<f64> {
    x.mat_vec(beta)
        .into_iter()
        .zip(offset.iter())
        .map(|(e, o)| e + o)
        .collect()
}

/// Model-based covariance (X'WX)^{-1}, with the same ridge fallback as IRLS.
pub(crate) fn covariance_from_xtwx(xtwx: &DenseMatrix) -> Result<DenseMatrix, FitFailure> {
    match CholeskyDecomp::new(xtwx) {
        Ok(chol) => Ok(chol.inverse()),
        Err(_) => {
            let (inv, _) = lane_linalg::decomposition::inverse_or_pinv(xtwx)?;
            Ok(inv)
        }
    }
}

/// NB GLM with theta by maximum likelihood, as in `glm.nb`.
pub fn fit_nb_glm(x: &DenseMatrix, series: &Series, config: &GlmConfig) -> Result<FittedModel, FitFailure> {
    let y = &series.response;
    let offset = series.offset_or_zero();

    let pois = irls(x, y, &offset, &NegBinomial::poisson(), None, config.max_iter, config.tol)?;
    let mut theta = estimate_theta(y, &pois.mu, config.theta_max_iter, config.theta_tol);
    let mut fit = pois;
    let mut family = NegBinomial::new(theta);
    let mut loglik = family.log_likelihood(y, &fit.mu);
    let mut converged = false;
    let mut outer = 0;

    for iter in 0..config.max_outer {
        outer = iter + 1;
        family = NegBinomial::new(theta);
        fit = irls(x, y, &offset, &family, Some(&fit.eta), config.max_iter, config.tol)?;
        let theta_new = estimate_theta(y, &fit.mu, config.theta_max_iter, config.theta_tol);
        let loglik_new = NegBinomial::new(theta_new).log_likelihood(y, &fit.mu);
        let d_ll = (loglik_new - loglik).abs() / (loglik_new.abs() + 0.1);
        let d_theta = (theta_new - theta).abs() / theta.max(1e-8);
        theta = theta_new;
        loglik = loglik_new;
        if d_ll < config.theta_tol && d_theta < config.theta_tol.sqrt() {
            converged = fit.converged;
            break;
        }
    }
    if !converged {
        warn!("NB GLM did not converge after {} theta updates (theta = {:.4})", outer, theta);
    }

    // Final IRLS pass so coefficients, weights and theta agree.
    family = NegBinomial::new(theta);
    let fit = irls(x, y, &offset, &family, Some(&fit.eta), config.max_iter, config.tol)?;
    let cov_model = covariance_from_xtwx(&fit.xtwx)?;
    if !cov_model.is_finite() {
        return Err(FitFailure::NonFinite("covariance"));
    }

    Ok(FittedModel {
        log_likelihood: Some(family.log_likelihood(y, &fit.mu)),
        deviance: fit.deviance,
        coefficients: fit.beta,
        theta,
        mu: fit.mu,
        eta: fit.eta,
        weights: fit.weights,
        cov_model,
        cov_robust: None,
        aux: BackendAux::Glm,
        converged: converged && fit.converged,
        iterations: outer,
    })
}
