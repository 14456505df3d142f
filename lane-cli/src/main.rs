//! lane: adaptive spline trajectory testing for count data.
//!
//! CLI entry point using clap for argument parsing.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lane",
    version,
    about = "lane-rs: adaptive negative binomial splines along pseudotime",
    long_about = "Tests whether gene expression changes along one or more pseudotime lineages.\n\
                   Fits MARGE hinge-spline models with GLM, GEE or GLMM backends."
)]
struct Cli {
    /// Number of worker threads
    #[arg(long, default_value = "1", global = true)]
    threads: usize,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every gene for dynamic expression along each lineage
    TestDynamic(commands::test_dynamic::TestDynamicArgs),

    /// Convert a counts TSV into a memory-mappable LNCM file
    ConvertCounts(commands::convert_counts::ConvertCountsArgs),

    /// Print the summary of a saved results file
    Summary(commands::summary::SummaryArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    tracing::info!("lane v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::TestDynamic(args) => commands::test_dynamic::run(args, cli.threads, cli.verbose > 0),
        Commands::ConvertCounts(args) => commands::convert_counts::run(args),
        Commands::Summary(args) => commands::summary::run(args),
    }
}
