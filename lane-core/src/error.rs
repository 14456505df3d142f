//! Input validation errors.
//!
//! Everything here is raised before any per-gene work is dispatched.
//! Per-unit numerical problems are `backend::FitFailure` values instead and
//! never abort a batch.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("count matrix has no genes or no cells")]
    EmptyCounts,

    #[error("count for gene '{gene}' at cell {cell} is not a non-negative integer: {value}")]
    InvalidCount { gene: String, cell: usize, value: f64 },

    #[error("{what}: expected length {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("pseudotime table has no lineage columns")]
    NoLineages,

    #[error("lineage {label} has no cells with a pseudotime value")]
    EmptyLineage { label: String },

    #[error("non-finite pseudotime {value} for cell {cell} in lineage {label}")]
    InvalidPseudotime { label: String, cell: usize, value: f64 },

    #[error("non-finite offset {value} for cell {cell}")]
    InvalidOffset { cell: usize, value: f64 },

    #[error("invalid value '{value}' for {option} (expected one of: {expected})")]
    InvalidOption {
        option: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{option} must be {requirement}, got {value}")]
    OutOfRange {
        option: &'static str,
        requirement: &'static str,
        value: String,
    },

    #[error("subject ids are required for the {backend} backend")]
    MissingSubjectIds { backend: String },

    #[error("subject ids must be sorted: '{previous}' precedes '{current}' at cell {position}")]
    UnsortedSubjectIds {
        position: usize,
        previous: String,
        current: String,
    },

    #[error("gene '{0}' not found in count matrix")]
    UnknownGene(String),

    #[error("failed to read counts: {0}")]
    CountRead(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}
