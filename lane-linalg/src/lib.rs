//! lane-linalg: Linear algebra wrappers for lane-rs
//!
//! Provides dense matrix operations and the decompositions used by the
//! negative binomial model backends and the test statistics.

pub mod dense;
pub mod decomposition;

pub use decomposition::LinalgError;
pub use dense::DenseMatrix;
