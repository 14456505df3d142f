//! Negative binomial GLMM with one random intercept per subject.
//!
//! Laplace approximation of the marginal likelihood. Each outer iteration:
//! Newton for the subject modes b_j, IRLS for beta with b in the offset,
//! sigma^2 = sum(b_j^2 + 1/H_j) / q, and an ML update of theta.

use lane_linalg::dense::DenseMatrix;
use tracing::{debug, warn};

use super::family::{estimate_theta, NegBinomial};
use super::glm::{covariance_from_xtwx, fit_nb_glm, irls, GlmConfig};
use super::{BackendAux, FitFailure, FittedModel};
use crate::data::{Series, SubjectGroups};
use crate::util::math::nb_log_density;

/// Configuration for NB GLMM fitting.
#[derive(Debug, Clone)]
pub struct GlmmConfig {
    pub max_iter: usize,
    /// Relative change of the Laplace log-likelihood for convergence.
    pub tol: f64,
    /// Newton iterations per subject mode.
    pub mode_max_iter: usize,
    /// Starting random-intercept variance.
    pub sigma2_init: f64,
    pub glm: GlmConfig,
}

impl Default for GlmmConfig {
    fn default() -> Self {
        Self {
            max_iter: 50,
            tol: 1e-7,
            mode_max_iter: 25,
            sigma2_init: 0.1,
            glm: GlmConfig::default(),
        }
    }
}

const MIN_SIGMA2: f64 = 1e-8;

/// Mode and curvature of one subject's random intercept.
#[derive(Debug, Clone, Copy)]
struct SubjectMode {
    b: f64,
    /// Negative second derivative of the penalized log-likelihood at b.
    h: f64,
}

/// Newton search for the mode of
/// sum_i l(y_i; exp(eta_i + b)) - b^2 / (2 sigma2).
fn subject_mode(y: &[f64], eta_fixed: &[f64], theta: f64, sigma2: f64, start: f64, max_iter: usize) -> SubjectMode {
    let mut b = start;
    let mut h = 1.0 / sigma2;
    for _ in 0..max_iter {
        let (mut g, mut hh) = (-b / sigma2, 1.0 / sigma2);
        for (&yi, &ei) in y.iter().zip(eta_fixed.iter()) {
            let mu = (ei + b).min(50.0).exp();
            let tm = theta + mu;
            g += theta * (yi - mu) / tm;
            hh += theta * (yi + theta) * mu / (tm * tm);
        }
        h = hh;
        let step = g / hh;
        b += step.clamp(-5.0, 5.0);
        if step.abs() < 1e-8 {
            break;
        }
    }
    SubjectMode { b, h }
}

fn laplace_loglik(y: &[f64], mu: &[f64], theta: f64, sigma2: f64, groups: &SubjectGroups, modes: &[SubjectMode]) -> f64 {
    groups
        .ranges()
        .iter()
        .zip(modes.iter())
        .map(|(r, m)| {
            let cond: f64 = r.clone().map(|i| nb_log_density(y[i], mu[i], theta)).sum();
            cond - m.b * m.b / (2.0 * sigma2) - 0.5 * sigma2.ln() - 0.5 * m.h.ln()
        })
        .sum()
}

/// Fit the NB random-intercept GLMM.
pub fn fit_nb_glmm(
    x: &DenseMatrix,
    series: &Series,
    groups: &SubjectGroups,
    config: &GlmmConfig,
) -> Result<FittedModel, FitFailure> {
    let y = &series.response;
    let offset = series.offset_or_zero();
    let membership = groups.membership();
    let q = groups.n_groups();

    let init = fit_nb_glm(x, series, &config.glm)?;
    let mut theta = init.theta;
    let mut beta = init.coefficients;
    let mut eta_fixed: Vec<f64> = init.eta;
    let mut sigma2 = config.sigma2_init;
    let mut modes = vec![SubjectMode { b: 0.0, h: 1.0 / sigma2 }; q];
    let mut loglik = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;
    let mut fit = None;

    for iter in 0..config.max_iter {
        iterations = iter + 1;
        for (j, r) in groups.ranges().iter().enumerate() {
            modes[j] = subject_mode(
                &y[r.clone()],
                &eta_fixed[r.clone()],
                theta,
                sigma2,
                modes[j].b,
                config.mode_max_iter,
            );
        }

        let re_offset: Vec<f64> = offset
            .iter()
            .zip(membership.iter())
            .map(|(o, &g)| o + modes[g].b)
            .collect();
        let start_eta: Vec<f64> = eta_fixed
            .iter()
            .zip(membership.iter())
            .map(|(e, &g)| e + modes[g].b)
            .collect();
        let family = NegBinomial::new(theta);
        let step = irls(x, y, &re_offset, &family, Some(&start_eta), config.glm.max_iter, config.glm.tol)?;
        beta = step.beta.clone();
        eta_fixed = step
            .eta
            .iter()
            .zip(membership.iter())
            .map(|(e, &g)| e - modes[g].b)
            .collect();

        sigma2 = (modes.iter().map(|m| m.b * m.b + 1.0 / m.h).sum::<f64>() / q as f64).max(MIN_SIGMA2);
        theta = estimate_theta(y, &step.mu, config.glm.theta_max_iter, config.glm.theta_tol);

        let ll = laplace_loglik(y, &step.mu, theta, sigma2, groups, &modes);
        if !ll.is_finite() {
            return Err(FitFailure::NonFinite("Laplace log-likelihood"));
        }
        let change = (ll - loglik).abs() / (ll.abs() + 0.1);
        loglik = ll;
        fit = Some(step);
        if change < config.tol {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!("GLMM did not converge after {} iterations (sigma2 = {:.4})", iterations, sigma2);
    }
    let fit = fit.ok_or(FitFailure::Singular)?;
    let cov_model = covariance_from_xtwx(&fit.xtwx)?;
    if beta.iter().any(|b| !b.is_finite()) || !cov_model.is_finite() {
        return Err(FitFailure::NonFinite("coefficients"));
    }
    debug!(
        "GLMM converged={} after {} iterations: sigma2={:.4}, theta={:.4}, loglik={:.4}",
        converged, iterations, sigma2, theta, loglik
    );

    let family = NegBinomial::new(theta);
    Ok(FittedModel {
        coefficients: beta,
        theta,
        deviance: family.deviance(y, &fit.mu),
        weights: family.working_weights(&fit.mu),
        mu: fit.mu,
        eta: fit.eta,
        log_likelihood: Some(loglik),
        cov_model,
        cov_robust: None,
        aux: BackendAux::Glmm {
            sigma2,
            random_effects: modes.iter().map(|m| m.b).collect(),
        },
        converged,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::nb_draws;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand::Rng;

    #[test]
    fn test_subject_mode_zero_when_data_match() {
        let y = vec![4.0; 10];
        let eta = vec![4.0f64.ln(); 10];
        let m = subject_mode(&y, &eta, 10.0, 1.0, 0.0, 25);
        assert!(m.b.abs() < 1e-8);
        assert!(m.h > 1.0);
    }

    #[test]
    fn test_glmm_recovers_random_intercepts() {
        let (q, per) = (30, 10);
        let n = q * per;
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let b: Vec<f64> = (0..q).map(|_| rng.gen_range(-0.8..0.8)).collect();
        let t: Vec<f64> = (0..n).map(|i| (i % per) as f64 / per as f64).collect();
        let mu: Vec<f64> = (0..n).map(|i| (1.5 + t[i] + b[i / per]).exp()).collect();
        let y = nb_draws(&mu, 8.0, 17);
        let ids: Vec<String> = (0..n).map(|i| format!("s{:02}", i / per)).collect();
        let groups = SubjectGroups::from_sorted_ids(&ids).unwrap();
        let series = Series::new(y, t.clone(), None, Some(groups.clone())).unwrap();
        let x = DenseMatrix::intercept(n).with_columns(&[t]);

        let fit = fit_nb_glmm(&x, &series, &groups, &GlmmConfig::default()).unwrap();
        let (sigma2, re) = match &fit.aux {
            BackendAux::Glmm { sigma2, random_effects } => (*sigma2, random_effects.clone()),
            _ => panic!("wrong aux"),
        };
        assert!(sigma2 > 0.05 && sigma2 < 0.6, "sigma2 = {}", sigma2);
        assert_eq!(re.len(), q);
        let corr = {
            let mb = b.iter().sum::<f64>() / q as f64;
            let mr = re.iter().sum::<f64>() / q as f64;
            let cov: f64 = b.iter().zip(re.iter()).map(|(x, y)| (x - mb) * (y - mr)).sum();
            let vb: f64 = b.iter().map(|x| (x - mb).powi(2)).sum();
            let vr: f64 = re.iter().map(|y| (y - mr).powi(2)).sum();
            cov / (vb * vr).sqrt()
        };
        assert!(corr > 0.8, "correlation of predicted and true effects: {}", corr);
        assert!(fit.log_likelihood.unwrap().is_finite());
    }
}
