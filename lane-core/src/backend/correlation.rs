//! GEE working correlation structures and small-sample corrections.

use std::fmt;
use std::str::FromStr;

use lane_linalg::dense::DenseMatrix;
use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::util::math::clamp;

/// Working correlation within a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationStructure {
    Independence,
    Exchangeable,
    #[default]
    Ar1,
}

impl CorrelationStructure {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationStructure::Independence => "independence",
            CorrelationStructure::Exchangeable => "exchangeable",
            CorrelationStructure::Ar1 => "ar1",
        }
    }

    /// R(alpha) for a cluster of size m.
    pub fn matrix(&self, m: usize, alpha: f64) -> DenseMatrix {
        let mut r = DenseMatrix::identity(m);
        match self {
            CorrelationStructure::Independence => {}
            CorrelationStructure::Exchangeable => {
                for i in 0..m {
                    for j in 0..m {
                        if i != j {
                            r.set(i, j, alpha);
                        }
                    }
                }
            }
            CorrelationStructure::Ar1 => {
                for i in 0..m {
                    for j in 0..m {
                        r.set(i, j, alpha.powi(i.abs_diff(j) as i32));
                    }
                }
            }
        }
        r
    }

    /// Closed-form R(alpha)^{-1} for a cluster of size m.
    pub fn inverse(&self, m: usize, alpha: f64) -> DenseMatrix {
        match self {
            CorrelationStructure::Independence => DenseMatrix::identity(m),
            CorrelationStructure::Exchangeable => {
                let c = alpha / (1.0 + (m as f64 - 1.0) * alpha);
                let s = 1.0 / (1.0 - alpha);
                let mut inv = DenseMatrix::zeros(m, m);
                for i in 0..m {
                    for j in 0..m {
                        let v = if i == j { 1.0 - c } else { -c };
                        inv.set(i, j, s * v);
                    }
                }
                inv
            }
            CorrelationStructure::Ar1 => {
                if m == 1 {
                    return DenseMatrix::identity(1);
                }
                let s = 1.0 / (1.0 - alpha * alpha);
                let mut inv = DenseMatrix::zeros(m, m);
                for i in 0..m {
                    let d = if i == 0 || i == m - 1 { 1.0 } else { 1.0 + alpha * alpha };
                    inv.set(i, i, s * d);
                    if i + 1 < m {
                        inv.set(i, i + 1, -s * alpha);
                        inv.set(i + 1, i, -s * alpha);
                    }
                }
                inv
            }
        }
    }

    /// Moment estimate of alpha from Pearson residuals grouped by cluster.
    ///
    /// `n_params` is subtracted from the pair count as in the
    /// Liang-Zeger estimators.
    pub fn estimate_alpha(
        &self,
        pearson: &[f64],
        ranges: &[std::ops::Range<usize>],
        phi: f64,
        n_params: usize,
    ) -> f64 {
        let (mut num, mut pairs) = (0.0, 0.0);
        match self {
            CorrelationStructure::Independence => return 0.0,
            CorrelationStructure::Exchangeable => {
                for r in ranges {
                    let e = &pearson[r.clone()];
                    let s: f64 = e.iter().sum();
                    let ss: f64 = e.iter().map(|v| v * v).sum();
                    num += 0.5 * (s * s - ss);
                    pairs += (e.len() * e.len().saturating_sub(1)) as f64 / 2.0;
                }
            }
            CorrelationStructure::Ar1 => {
                for r in ranges {
                    let e = &pearson[r.clone()];
                    num += e.windows(2).map(|w| w[0] * w[1]).sum::<f64>();
                    pairs += e.len().saturating_sub(1) as f64;
                }
            }
        }
        let denom = phi * (pairs - n_params as f64).max(1.0);
        if pairs == 0.0 || !(num / denom).is_finite() {
            return 0.0;
        }
        let max_size = ranges.iter().map(|r| r.len()).max().unwrap_or(1);
        self.clamp_alpha(num / denom, max_size)
    }

    /// Keep alpha inside the region where R(alpha) stays positive definite.
    pub fn clamp_alpha(&self, alpha: f64, max_cluster: usize) -> f64 {
        match self {
            CorrelationStructure::Independence => 0.0,
            CorrelationStructure::Exchangeable => {
                let lower = if max_cluster > 1 {
                    -1.0 / (max_cluster as f64 - 1.0) + 1e-3
                } else {
                    -0.98
                };
                clamp(alpha, lower, 0.98)
            }
            CorrelationStructure::Ar1 => clamp(alpha, -0.98, 0.98),
        }
    }
}

impl fmt::Display for CorrelationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrelationStructure {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "independence" => Ok(CorrelationStructure::Independence),
            "exchangeable" => Ok(CorrelationStructure::Exchangeable),
            "ar1" => Ok(CorrelationStructure::Ar1),
            _ => Err(InputError::InvalidOption {
                option: "cor_structure",
                value: s.to_string(),
                expected: "ar1, independence, exchangeable",
            }),
        }
    }
}

/// Small-sample correction applied to the sandwich covariance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BiasCorrection {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Kauermann-Carroll leverage adjustment of the cluster residuals.
    #[serde(rename = "kc")]
    KauermannCarroll,
    /// Multiply by K / (K - p).
    #[serde(rename = "df")]
    DegreesOfFreedom,
}

impl BiasCorrection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiasCorrection::None => "none",
            BiasCorrection::KauermannCarroll => "kc",
            BiasCorrection::DegreesOfFreedom => "df",
        }
    }
}

impl fmt::Display for BiasCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BiasCorrection {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(BiasCorrection::None),
            "kc" => Ok(BiasCorrection::KauermannCarroll),
            "df" => Ok(BiasCorrection::DegreesOfFreedom),
            _ => Err(InputError::InvalidOption {
                option: "sandwich_method",
                value: s.to_string(),
                expected: "none, kc, df",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_inverse(cs: CorrelationStructure, m: usize, alpha: f64) {
        let prod = cs.matrix(m, alpha).mat_mul(&cs.inverse(m, alpha));
        for i in 0..m {
            for j in 0..m {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (prod.get(i, j) - expected).abs() < 1e-10,
                    "{:?} m={} alpha={} ({}, {}) = {}",
                    cs,
                    m,
                    alpha,
                    i,
                    j,
                    prod.get(i, j)
                );
            }
        }
    }

    #[test]
    fn test_closed_form_inverses() {
        for &m in &[1, 2, 5] {
            assert_inverse(CorrelationStructure::Independence, m, 0.0);
            assert_inverse(CorrelationStructure::Exchangeable, m, 0.3);
            assert_inverse(CorrelationStructure::Exchangeable, m, -0.1);
            assert_inverse(CorrelationStructure::Ar1, m, 0.6);
            assert_inverse(CorrelationStructure::Ar1, m, -0.4);
        }
    }

    #[test]
    fn test_ar1_alpha_estimate() {
        // Strongly alternating residuals give a negative lag-1 correlation.
        let e = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let alpha = CorrelationStructure::Ar1.estimate_alpha(&e, &[0..4, 4..8], 1.0, 0);
        assert!(alpha < -0.9);
    }

    #[test]
    fn test_exchangeable_clamped() {
        let e = vec![2.0, 2.0, 2.0, 2.0];
        let alpha = CorrelationStructure::Exchangeable.estimate_alpha(&e, &[0..2, 2..4], 1.0, 0);
        assert!((alpha - 0.98).abs() < 1e-12);
    }

    #[test]
    fn test_parse_options() {
        assert_eq!("AR1".parse::<CorrelationStructure>().unwrap(), CorrelationStructure::Ar1);
        assert_eq!("kc".parse::<BiasCorrection>().unwrap(), BiasCorrection::KauermannCarroll);
        assert!("sandwich".parse::<BiasCorrection>().is_err());
        assert_eq!(CorrelationStructure::default(), CorrelationStructure::Ar1);
        assert_eq!(BiasCorrection::default(), BiasCorrection::None);
    }
}
