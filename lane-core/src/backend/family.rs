//! Negative binomial (NB2) family with log link.
//!
//! Var(Y) = mu + mu^2 / theta. An infinite theta gives the Poisson limit,
//! which is used for the starting fit.

use statrs::function::gamma::digamma;
use tracing::debug;

use crate::util::math::{clamp, nb_deviance, nb_log_likelihood, trigamma};

pub const MIN_THETA: f64 = 1e-8;
pub const MAX_THETA: f64 = 1e6;

const MIN_MU: f64 = 1e-10;
const MAX_ETA: f64 = 50.0;

/// NB2 family at a fixed size parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegBinomial {
    pub theta: f64,
}

impl NegBinomial {
    pub fn new(theta: f64) -> Self {
        Self { theta }
    }

    /// Poisson limit (theta = infinity).
    pub fn poisson() -> Self {
        Self {
            theta: f64::INFINITY,
        }
    }

    pub fn is_poisson(&self) -> bool {
        self.theta.is_infinite()
    }

    /// mu = exp(eta), kept away from zero and overflow.
    pub fn inv_link(&self, eta: &[f64]) -> Vec<f64> {
        eta.iter().map(|&e| e.min(MAX_ETA).exp().max(MIN_MU)).collect()
    }

    pub fn variance(&self, mu: f64) -> f64 {
        if self.is_poisson() {
            mu
        } else {
            mu + mu * mu / self.theta
        }
    }

    /// IRLS weights for the log link: (dmu/deta)^2 / Var = mu / (1 + mu/theta).
    pub fn working_weights(&self, mu: &[f64]) -> Vec<f64> {
        mu.iter()
            .map(|&m| {
                if self.is_poisson() {
                    m
                } else {
                    m / (1.0 + m / self.theta)
                }
            })
            .collect()
    }

    /// Working response without offset: eta - offset + (y - mu) / mu.
    pub fn working_response(&self, y: &[f64], mu: &[f64], eta: &[f64], offset: &[f64]) -> Vec<f64> {
        y.iter()
            .zip(mu.iter())
            .zip(eta.iter().zip(offset.iter()))
            .map(|((&yi, &mi), (&ei, &oi))| ei - oi + (yi - mi) / mi)
            .collect()
    }

    pub fn deviance(&self, y: &[f64], mu: &[f64]) -> f64 {
        if self.is_poisson() {
            y.iter()
                .zip(mu.iter())
                .map(|(&yi, &mi)| {
                    let a = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
                    2.0 * (a - (yi - mi))
                })
                .sum()
        } else {
            nb_deviance(y, mu, self.theta)
        }
    }

    pub fn log_likelihood(&self, y: &[f64], mu: &[f64]) -> f64 {
        nb_log_likelihood(y, mu, self.theta)
    }
}

/// Maximum likelihood estimate of theta given fitted means.
///
/// Newton iterations on the profile score from the moment start
/// n / sum((y/mu - 1)^2). Data without overdispersion return `MAX_THETA`.
pub fn estimate_theta(y: &[f64], mu: &[f64], max_iter: usize, tol: f64) -> f64 {
    let n = y.len() as f64;
    let moment: f64 = y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| (yi / mi - 1.0).powi(2))
        .sum();
    if moment.is_nan() || moment <= 0.0 {
        return MAX_THETA;
    }
    let mut theta = clamp(n / moment, MIN_THETA, MAX_THETA);

    for iter in 0..max_iter {
        let (mut score, mut info) = (0.0, 0.0);
        for (&yi, &mi) in y.iter().zip(mu.iter()) {
            let tm = theta + mi;
            score += digamma(yi + theta) - digamma(theta) + theta.ln() + 1.0 - tm.ln() - (yi + theta) / tm;
            info += -trigamma(yi + theta) + trigamma(theta) - 1.0 / theta + 2.0 / tm
                - (yi + theta) / (tm * tm);
        }
        if !score.is_finite() || !info.is_finite() || info <= 0.0 {
            debug!("theta Newton stopped at iteration {} (info = {})", iter, info);
            break;
        }
        let step = score / info;
        let next = clamp(theta + step, MIN_THETA, MAX_THETA);
        let change = (next - theta).abs();
        theta = next;
        if change < tol * theta.max(1.0) || theta >= MAX_THETA {
            break;
        }
    }
    theta
}
