//! Forward pass: greedy addition of hinge terms screened by a score test.
//!
//! For candidate columns B against the current fit (design X, weights W):
//!   U = B'((y - mu) / (1 + mu/theta))
//!   V = B'WB - B'WX (X'WX)^{-1} X'WB
//!   T = U' V^{-1} U,  T ~ chi2(ncol(B)) when B adds nothing.
//! Candidates enter only if `m * P(chi2 > T) <= entry_alpha`, m being the
//! number of candidates scored at that step. The surviving candidates with
//! the largest scores are refitted with the backend and the best fit wins.

use lane_linalg::decomposition::inverse_or_pinv;
use lane_linalg::dense::DenseMatrix;
use rand::Rng;
use tracing::debug;

use super::basis::{candidate_knots, BasisTerm, ColumnScreen};
use super::MargeConfig;
use crate::backend::family::NegBinomial;
use crate::backend::{Backend, FitFailure, FittedModel};
use crate::data::Series;
use crate::testing::chi_square_sf;

/// State after the forward pass.
#[derive(Debug, Clone)]
pub(crate) struct ForwardResult {
    pub terms: Vec<BasisTerm>,
    pub fit: FittedModel,
    pub design: DenseMatrix,
}

#[derive(Debug, Clone)]
struct Candidate {
    terms: Vec<BasisTerm>,
    columns: Vec<Vec<f64>>,
    score: f64,
    p_value: f64,
}

/// Score residual (y - mu) / (1 + mu/theta) = w (y - mu) / mu.
fn score_residuals(y: &[f64], fit: &FittedModel) -> Vec<f64> {
    y.iter()
        .zip(fit.mu.iter())
        .zip(fit.weights.iter())
        .map(|((&yi, &mi), &wi)| wi * (yi - mi) / mi)
        .collect()
}

/// Score statistic of `columns` given the current fit.
fn score_statistic(
    design: &DenseMatrix,
    xtwx_inv: &DenseMatrix,
    weights: &[f64],
    resid: &[f64],
    columns: &[Vec<f64>],
) -> Option<f64> {
    let b = DenseMatrix::from_columns(design.nrows(), columns);
    let u = b.t_mat_vec(resid);
    let xtwb = design.xtwz(weights, &b);
    let mut v = b.xtwx(weights).sub(&xtwb.transpose().mat_mul(xtwx_inv).mat_mul(&xtwb));
    v.symmetrize();
    let (v_inv, _) = inverse_or_pinv(&v).ok()?;
    let t = v_inv.quad_form(&u);
    t.is_finite().then_some(t.max(0.0))
}

/// Every admissible option at this step with its score test, best first.
fn scored_candidates(
    series: &Series,
    design: &DenseMatrix,
    fit: &FittedModel,
    terms: &[BasisTerm],
    knots: &[f64],
    slots: usize,
) -> Vec<Candidate> {
    let x = &series.pseudotime;
    let resid = score_residuals(&series.response, fit);
    let Ok((xtwx_inv, _)) = inverse_or_pinv(&design.xtwx(&fit.weights)) else {
        return Vec::new();
    };
    let screen = ColumnScreen::new(design);

    let mut scored = Vec::new();
    for &knot in knots {
        // Single ordering variable: hinges only multiply the root.
        let pair: Vec<BasisTerm> = BasisTerm::pair(knot, None)
            .into_iter()
            .filter(|t| !terms.iter().any(|e| e.same_hinge(t)))
            .collect();
        let columns: Vec<Vec<f64>> = pair.iter().map(|t| t.evaluate(x, terms)).collect();
        let mask = screen.admit(&columns);
        let admitted: Vec<(BasisTerm, Vec<f64>)> = pair
            .into_iter()
            .zip(columns)
            .zip(mask)
            .filter_map(|(tc, ok)| ok.then_some(tc))
            .collect();
        if admitted.is_empty() {
            continue;
        }

        let options: Vec<Vec<(BasisTerm, Vec<f64>)>> = if slots >= admitted.len() {
            vec![admitted]
        } else {
            admitted.into_iter().map(|tc| vec![tc]).collect()
        };
        for option in options {
            let (opt_terms, opt_cols): (Vec<BasisTerm>, Vec<Vec<f64>>) = option.into_iter().unzip();
            let Some(score) = score_statistic(design, &xtwx_inv, &fit.weights, &resid, &opt_cols) else {
                continue;
            };
            let Some(p_value) = chi_square_sf(score, opt_cols.len()) else {
                continue;
            };
            scored.push(Candidate {
                terms: opt_terms,
                columns: opt_cols,
                score,
                p_value,
            });
        }
    }
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// Lack of fit used to compare models: negative log-likelihood when the
/// backend reports one, otherwise deviance under `family`.
fn fit_loss(fit: &FittedModel, family: &NegBinomial, y: &[f64]) -> f64 {
    match fit.log_likelihood {
        Some(ll) => -ll,
        None => family.deviance(y, &fit.mu),
    }
}

/// True when `new` fits better than `old`: higher log-likelihood when both
/// have one, otherwise lower deviance at the old theta.
fn improves(old: &FittedModel, new: &FittedModel, y: &[f64]) -> bool {
    match (old.log_likelihood, new.log_likelihood) {
        (Some(a), Some(b)) => b > a,
        _ => {
            let family = NegBinomial::new(old.theta);
            family.deviance(y, &new.mu) < family.deviance(y, &old.mu)
        }
    }
}

/// Grow the model from the intercept-only fit.
///
/// Fails only when the intercept-only start cannot be fitted; later
/// failures stop the search at the last valid model.
pub(crate) fn forward_pass<R: Rng + ?Sized>(
    series: &Series,
    backend: &Backend,
    config: &MargeConfig,
    rng: &mut R,
) -> Result<ForwardResult, FitFailure> {
    let n = series.len();
    let y = &series.response;
    let mut terms: Vec<BasisTerm> = Vec::new();
    let mut design = DenseMatrix::intercept(n);
    let mut fit = backend.fit(&design, series)?;

    let max_knots = config.approx_knot.then_some(config.max_candidate_knots);
    let knots = candidate_knots(&series.pseudotime, config.end_span, max_knots, rng);
    debug!("forward pass: {} observations, {} candidate knots", n, knots.len());

    while terms.len() < config.max_terms {
        let slots = config.max_terms - terms.len();
        let scored = scored_candidates(series, &design, &fit, &terms, &knots, slots);
        let m = scored.len() as f64;
        let Some(top) = scored.first() else {
            debug!("forward pass: no admissible candidate left");
            break;
        };
        if top.p_value * m > config.entry_alpha {
            debug!(
                "forward pass: best score {:.3} (p = {:.3e}, {} candidates) fails the entry gate",
                top.score,
                top.p_value,
                scored.len()
            );
            break;
        }

        let family = NegBinomial::new(fit.theta);
        let mut best: Option<(Candidate, DenseMatrix, FittedModel, f64)> = None;
        for cand in scored
            .into_iter()
            .filter(|c| c.p_value * m <= config.entry_alpha)
            .take(config.refit_candidates.max(1))
        {
            let new_design = design.with_columns(&cand.columns);
            match backend.fit(&new_design, series) {
                Ok(new_fit) => {
                    let loss = fit_loss(&new_fit, &family, y);
                    if loss.is_finite() && best.as_ref().map_or(true, |b| loss < b.3) {
                        best = Some((cand, new_design, new_fit, loss));
                    }
                }
                Err(e) => debug!("forward pass: refit with knot {:.4} failed ({})", cand.terms[0].knot, e),
            }
        }

        match best {
            Some((cand, new_design, new_fit, _)) if improves(&fit, &new_fit, y) => {
                debug!(
                    "forward pass: added {} (score {:.4}, p = {:.3e})",
                    cand.terms.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", "),
                    cand.score,
                    cand.p_value
                );
                terms.extend(cand.terms);
                design = new_design;
                fit = new_fit;
            }
            Some(_) => {
                debug!("forward pass: refit did not improve the fit");
                break;
            }
            None => {
                debug!("forward pass: every refit failed, keeping {} terms", terms.len());
                break;
            }
        }
    }

    Ok(ForwardResult { terms, fit, design })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GlmConfig;
    use rand::distributions::Distribution;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use statrs::distribution::{Gamma, Poisson};

    fn series_from(y: Vec<f64>) -> Series {
        let n = y.len();
        Series::new(y, (0..n).map(|i| i as f64 / n as f64).collect(), None, None).unwrap()
    }

    #[test]
    fn test_forward_finds_change_point() {
        // Flat then rising after t = 0.5.
        let y: Vec<f64> = (0..60)
            .map(|i| {
                let t = i as f64 / 60.0;
                (2.0 + 6.0 * (t - 0.5).max(0.0)).exp().round()
            })
            .collect();
        let series = series_from(y);
        let config = MargeConfig {
            max_terms: 2,
            ..MargeConfig::default()
        };
        let backend = Backend::Glm(GlmConfig::default());
        let res = forward_pass(&series, &backend, &config, &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        assert!(!res.terms.is_empty() && res.terms.len() <= 2);
        assert!(res.terms.iter().any(|t| (t.knot - 0.5).abs() < 0.15), "{:?}", res.terms);
        assert_eq!(res.design.ncols(), res.terms.len() + 1);
    }

    #[test]
    fn test_flat_series_adds_nothing() {
        let series = series_from(vec![5.0; 40]);
        let backend = Backend::Glm(GlmConfig::default());
        let res = forward_pass(&series, &backend, &MargeConfig::default(), &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        assert!(res.terms.is_empty());
    }

    #[test]
    fn test_single_slot_takes_one_hinge() {
        let y: Vec<f64> = (0..40).map(|i| (1.0 + i as f64 / 10.0).exp().round()).collect();
        let config = MargeConfig {
            max_terms: 1,
            ..MargeConfig::default()
        };
        let backend = Backend::Glm(GlmConfig::default());
        let res = forward_pass(&series_from(y), &backend, &config, &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        assert_eq!(res.terms.len(), 1);
    }

    #[test]
    fn test_noisy_flat_series_rarely_enters() {
        let backend = Backend::Glm(GlmConfig::default());
        let mut entered = 0;
        for seed in 0..40u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let y: Vec<f64> = (0..100)
                .map(|_| {
                    let g = Gamma::new(5.0, 5.0 / 6.0).unwrap().sample(&mut rng);
                    Poisson::new(g.max(1e-12)).unwrap().sample(&mut rng)
                })
                .collect();
            let res = forward_pass(&series_from(y), &backend, &MargeConfig::default(), &mut rng).unwrap();
            if !res.terms.is_empty() {
                entered += 1;
            }
        }
        // Family-wise entry level 0.05 per step.
        assert!(entered <= 8, "{} of 40 flat series entered", entered);
    }
}
