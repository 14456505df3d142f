//! lane-io: input files for lane-rs.
//!
//! Memory-mapped count matrices (LNCM), TSV conversion, pseudotime tables
//! and per-cell metadata (offsets, subject ids).

pub mod cell_meta;
pub mod counts;
pub mod pseudotime;

pub use cell_meta::{read_cell_metadata, CellMetadata, MetadataColumns};
pub use counts::{counts_tsv_to_tempfile, MappedCountMatrix, TempCountMatrix};
pub use pseudotime::{align_pseudotime, read_pseudotime};
