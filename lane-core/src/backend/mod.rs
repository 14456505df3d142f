//! Negative binomial model backends.
//!
//! Three fitting strategies share one contract, `Backend::fit(design, series)`:
//! an independent NB GLM (IRLS with ML theta), an NB GEE with a working
//! correlation over subjects, and an NB GLMM with a random intercept per
//! subject. The backend is chosen once per run; every per-series numerical
//! problem comes back as a typed [`FitFailure`].

pub mod correlation;
pub mod family;
pub mod gee;
pub mod glm;
pub mod glmm;

use std::fmt;
use std::str::FromStr;

use lane_linalg::dense::DenseMatrix;
use lane_linalg::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Series;
use crate::error::InputError;

pub use correlation::{BiasCorrection, CorrelationStructure};
pub use gee::GeeConfig;
pub use glm::GlmConfig;
pub use glmm::GlmmConfig;

/// Why a single fit could not produce a model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("too few observations: {n} for {p} parameters")]
    TooFewObservations { n: usize, p: usize },

    #[error("response is all zero")]
    DegenerateResponse,

    #[error("non-finite {0}")]
    NonFinite(&'static str),

    #[error("singular information matrix")]
    Singular,

    #[error("subject grouping required by the {0} backend")]
    MissingGroups(BackendKind),

    #[error("linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
}

/// Backend selector as named on the command line and in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Glm,
    Gee,
    Glmm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Glm => "glm",
            BackendKind::Gee => "gee",
            BackendKind::Glmm => "glmm",
        }
    }

    /// GEE and GLMM need subject ids.
    pub fn requires_groups(&self) -> bool {
        !matches!(self, BackendKind::Glm)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "glm" => Ok(BackendKind::Glm),
            "gee" => Ok(BackendKind::Gee),
            "glmm" => Ok(BackendKind::Glmm),
            _ => Err(InputError::InvalidOption {
                option: "backend",
                value: s.to_string(),
                expected: "glm, gee, glmm",
            }),
        }
    }
}

/// Backend-specific pieces of a fit.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendAux {
    Glm,
    Gee {
        correlation: CorrelationStructure,
        alpha: f64,
        phi: f64,
        n_clusters: usize,
    },
    Glmm {
        sigma2: f64,
        random_effects: Vec<f64>,
    },
}

/// A fitted negative binomial model.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub coefficients: Vec<f64>,
    /// NB2 size parameter.
    pub theta: f64,
    /// Fitted means (conditional on random effects for GLMM).
    pub mu: Vec<f64>,
    /// Linear predictor including offset.
    pub eta: Vec<f64>,
    /// IRLS working weights mu / (1 + mu / theta).
    pub weights: Vec<f64>,
    /// `None` for GEE, which has no likelihood.
    pub log_likelihood: Option<f64>,
    pub deviance: f64,
    /// Model-based covariance of the coefficients.
    pub cov_model: DenseMatrix,
    /// Sandwich covariance (GEE only), bias corrected when requested.
    pub cov_robust: Option<DenseMatrix>,
    pub aux: BackendAux,
    pub converged: bool,
    pub iterations: usize,
}

impl FittedModel {
    pub fn n_params(&self) -> usize {
        self.coefficients.len()
    }

    /// Covariance used for Wald inference: robust when available.
    pub fn inference_cov(&self) -> &DenseMatrix {
        self.cov_robust.as_ref().unwrap_or(&self.cov_model)
    }
}

/// The estimation framework for one run, configured once.
#[derive(Debug, Clone)]
pub enum Backend {
    Glm(GlmConfig),
    Gee(GeeConfig),
    Glmm(GlmmConfig),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Glm(GlmConfig::default())
    }
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Glm(_) => BackendKind::Glm,
            Backend::Gee(_) => BackendKind::Gee,
            Backend::Glmm(_) => BackendKind::Glmm,
        }
    }

    /// Fit the NB model with the given design (intercept in column 0).
    pub fn fit(&self, x: &DenseMatrix, series: &Series) -> Result<FittedModel, FitFailure> {
        check_inputs(x, series)?;
        match self {
            Backend::Glm(config) => glm::fit_nb_glm(x, series, config),
            Backend::Gee(config) => {
                let groups = series
                    .groups
                    .as_ref()
                    .ok_or(FitFailure::MissingGroups(BackendKind::Gee))?;
                gee::fit_nb_gee(x, series, groups, config)
            }
            Backend::Glmm(config) => {
                let groups = series
                    .groups
                    .as_ref()
                    .ok_or(FitFailure::MissingGroups(BackendKind::Glmm))?;
                glmm::fit_nb_glmm(x, series, groups, config)
            }
        }
    }
}

/// Checks shared by all backends before any iteration starts.
fn check_inputs(x: &DenseMatrix, series: &Series) -> Result<(), FitFailure> {
    let n = series.len();
    let p = x.ncols();
    if x.nrows() != n {
        return Err(LinalgError::DimensionMismatch {
            expected: n,
            got: x.nrows(),
        }
        .into());
    }
    if n <= p {
        return Err(FitFailure::TooFewObservations { n, p });
    }
    if series.response.iter().all(|&y| y == 0.0) {
        return Err(FitFailure::DegenerateResponse);
    }
    if !x.is_finite() {
        return Err(FitFailure::NonFinite("design matrix"));
    }
    if let Some(off) = &series.offset {
        if off.iter().any(|v| !v.is_finite()) {
            return Err(FitFailure::NonFinite("offset"));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use statrs::distribution::{Gamma, Poisson};
    use rand::distributions::Distribution;

    /// Draw NB2 counts by the gamma-Poisson mixture.
    pub fn nb_draws(mu: &[f64], theta: f64, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        mu.iter()
            .map(|&m| {
                let g = Gamma::new(theta, theta / m).map_or(m, |d| d.sample(&mut rng));
                Poisson::new(g.max(1e-12)).map_or(0.0, |d| d.sample(&mut rng))
            })
            .collect()
    }
}
