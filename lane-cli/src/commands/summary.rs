//! Print the summary of a saved results file.
//!
//! lane summary --results-file run.lnrs [--top 20]

use std::path::Path;

use anyhow::Result;
use clap::Args;

use lane_core::dynamic::output::{load_results, results_summary};

#[derive(Args)]
pub struct SummaryArgs {
    /// Binary results file written by `test-dynamic --output-results`
    #[arg(long)]
    results_file: String,

    /// Also list the records with the smallest adjusted p-values
    #[arg(long, default_value = "0")]
    top: usize,
}

pub fn run(args: SummaryArgs) -> Result<()> {
    let results = load_results(Path::new(&args.results_file))?;
    println!("{}", results_summary(&results));

    if args.top > 0 {
        let mut ranked: Vec<_> = results.records().filter(|r| r.p_adj.is_some()).collect();
        ranked.sort_by(|a, b| a.p_adj.partial_cmp(&b.p_adj).unwrap_or(std::cmp::Ordering::Equal));
        println!("\ngene\tlineage\tp_adj\tknots");
        for r in ranked.into_iter().take(args.top) {
            println!(
                "{}\t{}\t{:.3e}\t{}",
                r.gene,
                r.lineage,
                r.p_adj.unwrap_or(f64::NAN),
                r.alt.as_ref().map_or_else(String::new, |a| a.knots_label())
            );
        }
    }
    Ok(())
}
