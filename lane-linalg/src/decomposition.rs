#![allow(clippy::needless_range_loop)]
//! Matrix decompositions and solvers.
//!
//! Cholesky for the weighted normal equations, modified Gram-Schmidt QR
//! for least-squares probes and colinearity checks, and a symmetric
//! eigendecomposition (faer) for pseudo-inverses and matrix square roots
//! used by the sandwich variance corrections.

use crate::dense::DenseMatrix;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Singular matrix encountered")]
    SingularMatrix,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Non-finite value in matrix")]
    NonFinite,
}

/// Result of a Cholesky decomposition.
pub struct CholeskyDecomp {
    /// Lower triangular factor L such that A = L * L'.
    pub l: DenseMatrix,
}

impl CholeskyDecomp {
    /// Compute the Cholesky decomposition of a symmetric positive definite matrix.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: a.ncols(),
            });
        }
        let mut l = DenseMatrix::zeros(n, n);

        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l.get(j, k) * l.get(j, k);
            }
            let diag = a.get(j, j) - sum;
            if !diag.is_finite() {
                return Err(LinalgError::NonFinite);
            }
            if diag <= 0.0 {
                return Err(LinalgError::NotPositiveDefinite);
            }
            l.set(j, j, diag.sqrt());

            for i in (j + 1)..n {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l.get(i, k) * l.get(j, k);
                }
                l.set(i, j, (a.get(i, j) - sum) / l.get(j, j));
            }
        }

        Ok(CholeskyDecomp { l })
    }

    /// Solve L * L' * x = b.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.l.nrows();
        assert_eq!(b.len(), n);

        // Forward substitution: L * y = b
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += self.l.get(i, j) * y[j];
            }
            y[i] = (b[i] - sum) / self.l.get(i, i);
        }

        // Backward substitution: L' * x = y
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += self.l.get(j, i) * x[j];
            }
            x[i] = (y[i] - sum) / self.l.get(i, i);
        }

        x
    }

    /// Compute the inverse of the original matrix A^{-1} = (L L')^{-1}.
    pub fn inverse(&self) -> DenseMatrix {
        let n = self.l.nrows();
        let mut inv = DenseMatrix::zeros(n, n);
        for j in 0..n {
            let mut e = vec![0.0; n];
            e[j] = 1.0;
            let col = self.solve(&e);
            inv.set_col(j, &col);
        }
        inv
    }
}

/// Result of a QR decomposition: A = Q * R.
pub struct QrDecomp {
    pub q: DenseMatrix,
    pub r: DenseMatrix,
}

impl QrDecomp {
    /// Compute the thin QR decomposition of an m x n matrix (m >= n).
    /// Uses modified Gram-Schmidt.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let m = a.nrows();
        let n = a.ncols();
        if m < n {
            return Err(LinalgError::DimensionMismatch { expected: n, got: m });
        }

        let mut q = DenseMatrix::zeros(m, n);
        let mut r = DenseMatrix::zeros(n, n);

        let mut cols: Vec<Vec<f64>> = (0..n).map(|j| a.col(j)).collect();

        for j in 0..n {
            for i in 0..j {
                let q_col = q.col(i);
                let rij = DenseMatrix::dot(&q_col, &cols[j]);
                r.set(i, j, rij);
                for k in 0..m {
                    cols[j][k] -= rij * q_col[k];
                }
            }

            let norm = DenseMatrix::dot(&cols[j], &cols[j]).sqrt();
            if !norm.is_finite() {
                return Err(LinalgError::NonFinite);
            }
            if norm < 1e-14 {
                return Err(LinalgError::SingularMatrix);
            }
            r.set(j, j, norm);
            for k in 0..m {
                q.set(k, j, cols[j][k] / norm);
            }
        }

        Ok(QrDecomp { q, r })
    }

    /// Solve R * x = Q' * b (least squares).
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.r.nrows();
        let qtb = self.q.t_mat_vec(b);

        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += self.r.get(i, j) * x[j];
            }
            x[i] = (qtb[i] - sum) / self.r.get(i, i);
        }
        x
    }
}

/// Eigendecomposition of a symmetric matrix: A = V * diag(values) * V'.
pub struct SymmetricEigen {
    /// Eigenvalues (ascending, as returned by faer).
    pub values: Vec<f64>,
    /// Eigenvectors stored as columns.
    pub vectors: DenseMatrix,
}

impl SymmetricEigen {
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: a.ncols(),
            });
        }
        if !a.is_finite() {
            return Err(LinalgError::NonFinite);
        }
        let evd = a.as_faer().selfadjoint_eigendecomposition(faer::Side::Lower);
        let s = evd.s();
        let u = evd.u();
        let values: Vec<f64> = (0..n).map(|i| s.column_vector().read(i)).collect();
        let mut vectors = DenseMatrix::zeros(n, n);
        for j in 0..n {
            for i in 0..n {
                vectors.set(i, j, u.read(i, j));
            }
        }
        Ok(Self { values, vectors })
    }

    /// Rebuild V * diag(f(values)) * V'.
    pub fn map_values<F: Fn(f64) -> f64>(&self, f: F) -> DenseMatrix {
        let n = self.values.len();
        let fv: Vec<f64> = self.values.iter().map(|&v| f(v)).collect();
        let mut out = DenseMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let mut s = 0.0;
                for k in 0..n {
                    if fv[k] != 0.0 {
                        s += self.vectors.get(i, k) * fv[k] * self.vectors.get(j, k);
                    }
                }
                out.set(i, j, s);
                out.set(j, i, s);
            }
        }
        out
    }

    /// Largest absolute eigenvalue.
    pub fn spectral_radius(&self) -> f64 {
        self.values.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }
}

/// Compute the inverse of a symmetric positive definite matrix.
pub fn inverse_spd(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let chol = CholeskyDecomp::new(a)?;
    Ok(chol.inverse())
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix.
///
/// Eigenvalues with |lambda| <= rel_tol * max|lambda| are treated as zero.
pub fn pseudo_inverse(a: &DenseMatrix, rel_tol: f64) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(a)?;
    let cutoff = rel_tol * eig.spectral_radius();
    if eig.spectral_radius() == 0.0 {
        return Err(LinalgError::SingularMatrix);
    }
    Ok(eig.map_values(|v| if v.abs() > cutoff { 1.0 / v } else { 0.0 }))
}

/// Inverse of a symmetric matrix: Cholesky when positive definite,
/// pseudo-inverse otherwise. The flag reports whether the fallback was used.
pub fn inverse_or_pinv(a: &DenseMatrix) -> Result<(DenseMatrix, bool), LinalgError> {
    match inverse_spd(a) {
        Ok(inv) if inv.is_finite() => Ok((inv, false)),
        _ => pseudo_inverse(a, 1e-10).map(|p| (p, true)),
    }
}

/// Symmetric square root of a positive semi-definite matrix.
pub fn sqrt_psd(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(a)?;
    Ok(eig.map_values(|v| v.max(0.0).sqrt()))
}

/// Symmetric inverse square root of a positive definite matrix.
pub fn inverse_sqrt_pd(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(a)?;
    let floor = 1e-12 * eig.spectral_radius().max(1e-300);
    if eig.values.iter().any(|&v| v <= floor) {
        return Err(LinalgError::NotPositiveDefinite);
    }
    Ok(eig.map_values(|v| 1.0 / v.sqrt()))
}
