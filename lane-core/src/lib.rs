//! lane-core: adaptive spline models and trajectory tests for count data.
//!
//! Fits negative binomial hinge-spline models (MARGE) of counts against
//! pseudotime with GLM, GEE or GLMM backends, tests them against an
//! intercept-only null (LRT, Wald, Score), and runs the whole pipeline over
//! many genes and lineages in parallel.

pub mod backend;
pub mod data;
pub mod dynamic;
pub mod error;
pub mod marge;
pub mod testing;
pub mod util;
