//! Hinge basis functions and candidate knot screening.

use std::fmt;

use lane_linalg::dense::DenseMatrix;
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Relative residual norm below which a candidate column counts as
/// colinear with the current design.
pub const COLINEAR_TOL: f64 = 1e-8;

/// Side of the knot on which a hinge is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HingeDirection {
    /// max(0, x - k)
    Plus,
    /// max(0, k - x)
    Minus,
}

impl HingeDirection {
    pub fn symbol(&self) -> char {
        match self {
            HingeDirection::Plus => '+',
            HingeDirection::Minus => '-',
        }
    }
}

/// Evaluate one hinge over `x`.
pub fn hinge(x: &[f64], knot: f64, direction: HingeDirection) -> Vec<f64> {
    match direction {
        HingeDirection::Plus => x.iter().map(|&v| (v - knot).max(0.0)).collect(),
        HingeDirection::Minus => x.iter().map(|&v| (knot - v).max(0.0)).collect(),
    }
}

/// A basis term: a hinge times the term it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasisTerm {
    pub knot: f64,
    pub direction: HingeDirection,
    /// Index of the parent term in the model's term list; `None` is the root.
    pub parent: Option<usize>,
}

impl BasisTerm {
    pub fn root(knot: f64, direction: HingeDirection) -> Self {
        Self {
            knot,
            direction,
            parent: None,
        }
    }

    /// The mirror hinge pair at `knot` under `parent`.
    pub fn pair(knot: f64, parent: Option<usize>) -> [BasisTerm; 2] {
        [
            BasisTerm {
                knot,
                direction: HingeDirection::Plus,
                parent,
            },
            BasisTerm {
                knot,
                direction: HingeDirection::Minus,
                parent,
            },
        ]
    }

    pub fn same_hinge(&self, other: &BasisTerm) -> bool {
        self.knot == other.knot && self.direction == other.direction
    }

    /// Column of this term over `x`; `terms` resolves the parent chain.
    pub fn evaluate(&self, x: &[f64], terms: &[BasisTerm]) -> Vec<f64> {
        let mut col = hinge(x, self.knot, self.direction);
        if let Some(p) = self.parent {
            let parent = terms[p].evaluate(x, terms);
            for (c, v) in col.iter_mut().zip(parent) {
                *c *= v;
            }
        }
        col
    }
}

impl fmt::Display for BasisTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            HingeDirection::Plus => write!(f, "h(x-{:.6})", self.knot)?,
            HingeDirection::Minus => write!(f, "h({:.6}-x)", self.knot)?,
        }
        if let Some(p) = self.parent {
            write!(f, "*t{}", p)?;
        }
        Ok(())
    }
}

/// Design matrix: intercept followed by one column per term.
pub fn design_matrix(x: &[f64], terms: &[BasisTerm]) -> DenseMatrix {
    let cols: Vec<Vec<f64>> = terms.iter().map(|t| t.evaluate(x, terms)).collect();
    DenseMatrix::intercept(x.len()).with_columns(&cols)
}

/// Candidate knots: unique ordering values after dropping the `end_span`
/// smallest and largest observations. With `max_knots` set and more unique
/// values than that, a random subset is drawn and re-sorted.
pub fn candidate_knots<R: Rng + ?Sized>(
    x: &[f64],
    end_span: usize,
    max_knots: Option<usize>,
    rng: &mut R,
) -> Vec<f64> {
    if x.len() <= 2 * end_span {
        return Vec::new();
    }
    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut knots: Vec<f64> = sorted[end_span..sorted.len() - end_span].to_vec();
    knots.dedup();
    match max_knots {
        Some(k) if knots.len() > k => {
            let mut idx = sample(rng, knots.len(), k).into_vec();
            idx.sort_unstable();
            idx.into_iter().map(|i| knots[i]).collect()
        }
        _ => knots,
    }
}

/// Gram-Schmidt screen of candidate columns against a design.
pub struct ColumnScreen {
    basis: Vec<Vec<f64>>,
}

impl ColumnScreen {
    /// Orthonormalize the design's columns. Columns already dependent on
    /// earlier ones are skipped.
    pub fn new(design: &DenseMatrix) -> Self {
        let mut screen = Self { basis: Vec::new() };
        for j in 0..design.ncols() {
            let col = design.col(j);
            if let Some(q) = screen.residual_direction(&col) {
                screen.basis.push(q);
            }
        }
        screen
    }

    /// Unit residual of `col` after projection, or `None` when the column
    /// is zero or colinear with the basis.
    fn residual_direction(&self, col: &[f64]) -> Option<Vec<f64>> {
        let norm = DenseMatrix::dot(col, col).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        let mut r = col.to_vec();
        // Two passes keep the projection stable.
        for _ in 0..2 {
            for q in &self.basis {
                let c = DenseMatrix::dot(q, &r);
                for (ri, qi) in r.iter_mut().zip(q.iter()) {
                    *ri -= c * qi;
                }
            }
        }
        let rn = DenseMatrix::dot(&r, &r).sqrt();
        if rn / norm < COLINEAR_TOL {
            return None;
        }
        Some(r.into_iter().map(|v| v / rn).collect())
    }

    /// Admissibility of each column, taken in order: constant columns and
    /// columns colinear with the design or an earlier admitted column fail.
    pub fn admit(&self, columns: &[Vec<f64>]) -> Vec<bool> {
        let mut local = Self {
            basis: self.basis.clone(),
        };
        columns
            .iter()
            .map(|c| {
                if is_constant(c) {
                    return false;
                }
                match local.residual_direction(c) {
                    Some(q) => {
                        local.basis.push(q);
                        true
                    }
                    None => false,
                }
            })
            .collect()
    }
}

fn is_constant(col: &[f64]) -> bool {
    let (lo, hi) = col
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    hi - lo <= 1e-12 * hi.abs().max(1.0)
}

/// Admissibility of `columns` against `design`.
pub fn admissible_columns(design: &DenseMatrix, columns: &[Vec<f64>]) -> Vec<bool> {
    ColumnScreen::new(design).admit(columns)
}
