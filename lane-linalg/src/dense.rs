#![allow(clippy::needless_range_loop)]
//! Dense matrix operations backed by faer.
//!
//! Wraps faer's column-major Mat<f64> with the handful of operations the
//! spline search and the model backends lean on: design-matrix assembly
//! column by column, weighted cross-products, and block extraction.

use faer::Mat;

/// A dense matrix wrapper around faer's `Mat<f64>`.
///
/// Column-major layout; design matrices keep observations in rows and
/// basis functions in columns.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    inner: Mat<f64>,
}

impl DenseMatrix {
    /// Create a new dense matrix filled with zeros.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            inner: Mat::zeros(nrows, ncols),
        }
    }

    /// Create a dense matrix from a 2D slice (row-major input).
    pub fn from_row_major(nrows: usize, ncols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        let inner = Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j]);
        Self { inner }
    }

    /// Build a matrix whose columns are the given vectors.
    ///
    /// All columns must share the same length; `nrows` is needed so that a
    /// zero-column matrix still knows its height.
    pub fn from_columns(nrows: usize, columns: &[Vec<f64>]) -> Self {
        for c in columns {
            assert_eq!(c.len(), nrows);
        }
        let inner = Mat::from_fn(nrows, columns.len(), |i, j| columns[j][i]);
        Self { inner }
    }

    /// Intercept-only design: an n x 1 column of ones.
    pub fn intercept(n: usize) -> Self {
        Self {
            inner: Mat::from_fn(n, 1, |_, _| 1.0),
        }
    }

    /// Create an identity matrix of size n x n.
    pub fn identity(n: usize) -> Self {
        let inner = Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
        Self { inner }
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Get element at (row, col).
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.inner.read(row, col)
    }

    /// Set element at (row, col).
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.inner.write(row, col, value);
    }

    /// Get a reference to the underlying faer matrix.
    pub fn as_faer(&self) -> &Mat<f64> {
        &self.inner
    }

    /// Matrix-vector product: self * v -> result vector.
    pub fn mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.ncols(), v.len());
        let n = self.nrows();
        let mut result = vec![0.0; n];
        for j in 0..self.ncols() {
            let vj = v[j];
            if vj == 0.0 {
                continue;
            }
            for i in 0..n {
                result[i] += self.inner.read(i, j) * vj;
            }
        }
        result
    }

    /// Transposed matrix-vector product: self' * v.
    pub fn t_mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.nrows(), v.len());
        (0..self.ncols())
            .map(|j| (0..self.nrows()).map(|i| self.inner.read(i, j) * v[i]).sum())
            .collect()
    }

    /// Matrix-matrix product: self * other.
    pub fn mat_mul(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.ncols(), other.nrows());
        let result = &self.inner * &other.inner;
        DenseMatrix { inner: result }
    }

    /// Transpose.
    pub fn transpose(&self) -> DenseMatrix {
        let inner = self.inner.transpose().to_owned();
        DenseMatrix { inner }
    }

    /// Extract column as a Vec<f64>.
    pub fn col(&self, j: usize) -> Vec<f64> {
        let n = self.nrows();
        let mut v = Vec::with_capacity(n);
        for i in 0..n {
            v.push(self.inner.read(i, j));
        }
        v
    }

    /// Set an entire column from a slice.
    pub fn set_col(&mut self, j: usize, data: &[f64]) {
        assert_eq!(data.len(), self.nrows());
        for i in 0..self.nrows() {
            self.inner.write(i, j, data[i]);
        }
    }

    /// Return a copy of self with the given columns appended on the right.
    pub fn with_columns(&self, extra: &[Vec<f64>]) -> DenseMatrix {
        let n = self.nrows();
        let p = self.ncols();
        for c in extra {
            assert_eq!(c.len(), n);
        }
        let inner = Mat::from_fn(n, p + extra.len(), |i, j| {
            if j < p {
                self.inner.read(i, j)
            } else {
                extra[j - p][i]
            }
        });
        DenseMatrix { inner }
    }

    /// Extract the block with the given row range and column range.
    pub fn block(
        &self,
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
    ) -> DenseMatrix {
        let (r0, c0) = (rows.start, cols.start);
        let inner = Mat::from_fn(rows.len(), cols.len(), |i, j| self.inner.read(r0 + i, c0 + j));
        DenseMatrix { inner }
    }

    /// Extract a principal submatrix indexed by `idx` on both axes.
    pub fn principal(&self, idx: &[usize]) -> DenseMatrix {
        let inner = Mat::from_fn(idx.len(), idx.len(), |i, j| self.inner.read(idx[i], idx[j]));
        DenseMatrix { inner }
    }

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) + other.inner.read(i, j)
        });
        DenseMatrix { inner }
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) - other.inner.read(i, j)
        });
        DenseMatrix { inner }
    }

    /// Scalar multiplication.
    pub fn scale(&self, s: f64) -> DenseMatrix {
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| self.inner.read(i, j) * s);
        DenseMatrix { inner }
    }

    /// Diagonal of a square matrix.
    pub fn diag(&self) -> Vec<f64> {
        let n = self.nrows().min(self.ncols());
        (0..n).map(|i| self.inner.read(i, i)).collect()
    }

    /// Add `v` to every diagonal element in place.
    pub fn add_to_diag(&mut self, v: f64) {
        for i in 0..self.nrows().min(self.ncols()) {
            let d = self.inner.read(i, i);
            self.inner.write(i, i, d + v);
        }
    }

    /// Replace self by (self + self') / 2 to wash out round-off asymmetry.
    pub fn symmetrize(&mut self) {
        let n = self.nrows();
        assert_eq!(n, self.ncols());
        for j in 0..n {
            for i in (j + 1)..n {
                let m = 0.5 * (self.inner.read(i, j) + self.inner.read(j, i));
                self.inner.write(i, j, m);
                self.inner.write(j, i, m);
            }
        }
    }

    /// True when every entry is finite.
    pub fn is_finite(&self) -> bool {
        (0..self.ncols()).all(|j| (0..self.nrows()).all(|i| self.inner.read(i, j).is_finite()))
    }

    /// Dot product of two vectors.
    pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Compute X' * diag(w) * X for design matrix X and weight vector w.
    /// Returns a p x p matrix where p = X.ncols().
    pub fn xtwx(&self, w: &[f64]) -> DenseMatrix {
        let n = self.nrows();
        let p = self.ncols();
        assert_eq!(w.len(), n);
        let mut result = DenseMatrix::zeros(p, p);
        for j in 0..p {
            for k in j..p {
                let mut s = 0.0;
                for i in 0..n {
                    s += self.inner.read(i, j) * w[i] * self.inner.read(i, k);
                }
                result.set(j, k, s);
                if j != k {
                    result.set(k, j, s);
                }
            }
        }
        result
    }

    /// Compute X' * diag(w) * Z for two matrices with the same row count.
    pub fn xtwz(&self, w: &[f64], z: &DenseMatrix) -> DenseMatrix {
        let n = self.nrows();
        assert_eq!(w.len(), n);
        assert_eq!(z.nrows(), n);
        let inner = Mat::from_fn(self.ncols(), z.ncols(), |j, k| {
            let mut s = 0.0;
            for i in 0..n {
                s += self.inner.read(i, j) * w[i] * z.inner.read(i, k);
            }
            s
        });
        DenseMatrix { inner }
    }

    /// Compute X' * diag(w) * v for design matrix X, weight vector w, and vector v.
    /// Returns a vector of length p = X.ncols().
    pub fn xtwv(&self, w: &[f64], v: &[f64]) -> Vec<f64> {
        let n = self.nrows();
        let p = self.ncols();
        assert_eq!(w.len(), n);
        assert_eq!(v.len(), n);
        let mut result = vec![0.0; p];
        for j in 0..p {
            let mut s = 0.0;
            for i in 0..n {
                s += self.inner.read(i, j) * w[i] * v[i];
            }
            result[j] = s;
        }
        result
    }

    /// Quadratic form v' * self * v for a square matrix.
    pub fn quad_form(&self, v: &[f64]) -> f64 {
        DenseMatrix::dot(v, &self.mat_vec(v))
    }
}

impl std::fmt::Display for DenseMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.nrows() {
            for j in 0..self.ncols() {
                if j > 0 {
                    write!(f, "\t")?;
                }
                write!(f, "{:.6}", self.inner.read(i, j))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
