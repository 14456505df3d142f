//! Backward pass: prune terms one at a time, down to the intercept-only
//! model, and keep the subset with the smallest generalized cross-validation
//! score.

use lane_linalg::dense::DenseMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::basis::{design_matrix, BasisTerm};
use super::forward::ForwardResult;
use super::{gcv, MargeConfig, MargeModel};
use crate::backend::family::NegBinomial;
use crate::backend::{Backend, FittedModel};
use crate::data::Series;

/// One step of the pruning sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneStep {
    pub n_terms: usize,
    pub gcv: f64,
    /// Term dropped to reach this step; `None` for the forward model.
    pub removed: Option<BasisTerm>,
}

/// Drop term `index`, shifting parent indices above it down by one.
///
/// Terms parented on `index` must have been removed first; see
/// [`removable_terms`].
pub fn remove_term(terms: &[BasisTerm], index: usize) -> Vec<BasisTerm> {
    terms
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, t)| BasisTerm {
            parent: t.parent.map(|p| if p > index { p - 1 } else { p }),
            ..*t
        })
        .collect()
}

/// Indices of terms no other term uses as parent.
pub fn removable_terms(terms: &[BasisTerm]) -> Vec<usize> {
    (0..terms.len())
        .filter(|&i| !terms.iter().any(|t| t.parent == Some(i)))
        .collect()
}

struct Subset {
    terms: Vec<BasisTerm>,
    fit: FittedModel,
    design: DenseMatrix,
    gcv: f64,
}

pub(crate) fn backward_pass(
    series: &Series,
    backend: &Backend,
    forward: ForwardResult,
    config: &MargeConfig,
) -> MargeModel {
    let n = series.len();
    let y = &series.response;
    let x = &series.pseudotime;
    // Deviances of every subset are compared at the forward model's theta.
    let common = NegBinomial::new(forward.fit.theta);
    let score = |fit: &FittedModel, p: usize| gcv(common.deviance(y, &fit.mu), n, p, config.penalty);

    let forward_terms = forward.terms.len();
    let forward_gcv = score(&forward.fit, forward.design.ncols());
    let mut path = vec![PruneStep {
        n_terms: forward_terms,
        gcv: forward_gcv,
        removed: None,
    }];
    let mut best = Subset {
        terms: forward.terms.clone(),
        fit: forward.fit,
        design: forward.design,
        gcv: forward_gcv,
    };

    let mut current = forward.terms;
    while !current.is_empty() {
        let mut step: Option<(usize, Vec<BasisTerm>, FittedModel, DenseMatrix, f64)> = None;
        for j in removable_terms(&current) {
            let candidate = remove_term(&current, j);
            let design = design_matrix(x, &candidate);
            match backend.fit(&design, series) {
                Ok(fit) => {
                    let dev = common.deviance(y, &fit.mu);
                    if step.as_ref().map_or(true, |s| dev < s.4) {
                        step = Some((j, candidate, fit, design, dev));
                    }
                }
                Err(e) => debug!("backward pass: refit without term {} failed ({})", j, e),
            }
        }
        let Some((j, terms, fit, design, _)) = step else {
            debug!("backward pass: no subset of {} terms could be fitted", current.len().saturating_sub(1));
            break;
        };
        let g = score(&fit, design.ncols());
        path.push(PruneStep {
            n_terms: terms.len(),
            gcv: g,
            removed: Some(current[j]),
        });
        if g < best.gcv {
            best = Subset {
                terms: terms.clone(),
                fit,
                design,
                gcv: g,
            };
        }
        current = terms;
    }

    debug!(
        "backward pass: kept {} of {} terms (GCV {:.4} -> {:.4})",
        best.terms.len(),
        forward_terms,
        forward_gcv,
        best.gcv
    );
    MargeModel {
        terms: best.terms,
        fit: best.fit,
        design: best.design,
        forward_terms,
        forward_gcv,
        selected_gcv: best.gcv,
        pruning_path: path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GlmConfig;
    use crate::marge::basis::HingeDirection;

    #[test]
    fn test_remove_term_reindexes_parents() {
        let terms = vec![
            BasisTerm::root(1.0, HingeDirection::Plus),
            BasisTerm::root(2.0, HingeDirection::Minus),
            BasisTerm {
                knot: 3.0,
                direction: HingeDirection::Plus,
                parent: Some(1),
            },
        ];
        assert_eq!(removable_terms(&terms), vec![0, 2]);
        let pruned = remove_term(&terms, 0);
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[1].parent, Some(0));
        assert_eq!(pruned[0].knot, 2.0);
    }

    #[test]
    fn test_flat_series_prunes_to_intercept() {
        // Forward model forced to two hinges on data with no trend.
        let n = 60;
        let x: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let y: Vec<f64> = (0..n).map(|i| [4.0, 6.0, 5.0, 7.0, 3.0, 5.0][i % 6]).collect();
        let series = Series::new(y, x.clone(), None, None).unwrap();
        let backend = Backend::Glm(GlmConfig::default());
        let terms = BasisTerm::pair(0.5, None).to_vec();
        let design = design_matrix(&x, &terms);
        let fit = backend.fit(&design, &series).unwrap();
        let forward = ForwardResult { terms, fit, design };

        let model = backward_pass(&series, &backend, forward, &MargeConfig::default());
        assert_eq!(model.n_terms(), 0);
        assert_eq!(model.design.ncols(), 1);
        assert_eq!(model.forward_terms, 2);
        assert_eq!(model.pruning_path.last().map(|s| s.n_terms), Some(0));
        assert!(model.selected_gcv < model.forward_gcv);

        let null = backend.fit(&DenseMatrix::intercept(n), &series).unwrap();
        let result = crate::testing::run_test(crate::testing::TestKind::Lrt, &model, &null, &series);
        assert_eq!(result.df, 0);
        assert_eq!(result.p_value, Some(1.0));
    }
}
