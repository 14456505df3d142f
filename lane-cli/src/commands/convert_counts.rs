//! Convert a counts TSV into an LNCM file for memory-mapped access.
//!
//! lane convert-counts --counts-tsv counts.tsv --output-file counts.lncm

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::info;

use lane_io::counts::convert_counts_tsv;

#[derive(Args)]
pub struct ConvertCountsArgs {
    /// Counts TSV: header with an id column and one column per cell, one row per gene
    #[arg(long)]
    counts_tsv: String,

    /// Output LNCM file
    #[arg(long)]
    output_file: String,
}

pub fn run(args: ConvertCountsArgs) -> Result<()> {
    info!("Converting {} -> {}", args.counts_tsv, args.output_file);
    let (n_genes, n_cells) = convert_counts_tsv(Path::new(&args.counts_tsv), Path::new(&args.output_file))?;
    println!("Wrote {} genes x {} cells to {}", n_genes, n_cells, args.output_file);
    Ok(())
}
