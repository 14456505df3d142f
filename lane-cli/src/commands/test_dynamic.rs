//! Dynamic expression testing over all genes and lineages.
//!
//! lane test-dynamic --counts ... --pseudotime ... --output-file ... [--cell-meta ... --subject-col ...]

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use lane_core::backend::{BackendKind, BiasCorrection, CorrelationStructure};
use lane_core::data::CountSource;
use lane_core::dynamic::output::{results_summary, save_results, write_results_json, write_results_tsv};
use lane_core::dynamic::{test_dynamic, DynamicTestConfig, DynamicTestInput};
use lane_core::testing::GeeTest;
use lane_io::cell_meta::{read_cell_metadata, MetadataColumns};
use lane_io::counts::{counts_tsv_to_tempfile, MappedCountMatrix, TempCountMatrix};
use lane_io::pseudotime::{align_pseudotime, read_pseudotime};

#[derive(Args)]
pub struct TestDynamicArgs {
    /// Count matrix: an LNCM file, or a TSV (genes x cells) converted on the fly
    #[arg(long)]
    counts: String,

    /// Pseudotime table (cell id, then one column per lineage; NA off-lineage)
    #[arg(long)]
    pseudotime: String,

    /// Output table (TSV)
    #[arg(long)]
    output_file: String,

    /// Also write the results as JSON
    #[arg(long)]
    output_json: Option<String>,

    /// Also save the results in binary form (readable by `lane summary`)
    #[arg(long)]
    output_results: Option<String>,

    /// Cell metadata file with offsets and/or subject ids
    #[arg(long)]
    cell_meta: Option<String>,

    /// Cell id column in the metadata file
    #[arg(long, default_value = "cell")]
    cell_id_col: String,

    /// Log-scale offset column in the metadata file
    #[arg(long, conflicts_with = "size_factor_col")]
    offset_col: Option<String>,

    /// Size factor column in the metadata file (log taken as the offset)
    #[arg(long)]
    size_factor_col: Option<String>,

    /// Subject id column in the metadata file (required for gee and glmm)
    #[arg(long)]
    subject_col: Option<String>,

    /// Genes to test (comma-separated); all genes by default
    #[arg(long)]
    genes: Option<String>,

    /// Model backend: glm, gee, or glmm
    #[arg(long, default_value = "glm")]
    backend: String,

    /// GEE working correlation: ar1, independence, or exchangeable
    #[arg(long, default_value = "ar1")]
    cor_structure: String,

    /// GEE sandwich bias correction: none, kc, or df
    #[arg(long, default_value = "none")]
    sandwich_method: String,

    /// GEE test statistic: wald or score
    #[arg(long, default_value = "wald")]
    gee_test: String,

    /// Use fixed knots instead of the adaptive search for glmm
    #[arg(long, default_value = "false")]
    glmm_fixed_knots: bool,

    /// Maximum number of basis functions
    #[arg(long, default_value = "5")]
    max_terms: usize,

    /// Search a random subset of candidate knots
    #[arg(long, default_value = "false")]
    approx_knot: bool,

    /// Minimum cells per lineage
    #[arg(long, default_value = "10")]
    min_cells: usize,

    /// Random seed
    #[arg(long, default_value = "312")]
    seed: u64,
}

enum Counts {
    Mapped(MappedCountMatrix),
    Converted(TempCountMatrix),
}

impl Counts {
    fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("Failed to open counts: {}", path.display()))?;
        let mut magic = [0u8; 4];
        let is_lncm = file.read_exact(&mut magic).is_ok() && magic == lane_io::counts::MAGIC;
        if is_lncm {
            Ok(Counts::Mapped(MappedCountMatrix::open(path)?))
        } else {
            info!("Converting counts TSV to a temporary LNCM file...");
            Ok(Counts::Converted(counts_tsv_to_tempfile(path)?))
        }
    }

    fn matrix(&self) -> &MappedCountMatrix {
        match self {
            Counts::Mapped(m) => m,
            Counts::Converted(t) => t.matrix(),
        }
    }
}

pub fn run(args: TestDynamicArgs, threads: usize, verbose: bool) -> Result<()> {
    info!("=== lane: dynamic expression test ===");
    let config = DynamicTestConfig {
        backend: args.backend.parse::<BackendKind>()?,
        cor_structure: args.cor_structure.parse::<CorrelationStructure>()?,
        bias_correction: args.sandwich_method.parse::<BiasCorrection>()?,
        gee_test: args.gee_test.parse::<GeeTest>()?,
        glmm_adaptive: !args.glmm_fixed_knots,
        max_terms: args.max_terms,
        approx_knot: args.approx_knot,
        n_workers: threads,
        seed: args.seed,
        verbose,
        min_cells: args.min_cells,
        ..Default::default()
    };
    config.validate()?;

    let counts = Counts::open(Path::new(&args.counts))?;
    let matrix = counts.matrix();
    info!("Counts: {} genes x {} cells", matrix.n_genes(), matrix.n_cells());

    let table = read_pseudotime(Path::new(&args.pseudotime))?;
    let table = align_pseudotime(&table, matrix.cell_ids())?;

    let meta = match &args.cell_meta {
        Some(path) => {
            let (offset_col, log_offset) = match (&args.offset_col, &args.size_factor_col) {
                (Some(col), _) => (Some(col.as_str()), false),
                (None, Some(col)) => (Some(col.as_str()), true),
                (None, None) => (None, false),
            };
            let columns = MetadataColumns {
                cell_id: &args.cell_id_col,
                offset: offset_col,
                subject: args.subject_col.as_deref(),
                log_offset,
            };
            Some(read_cell_metadata(Path::new(path), &columns)?.align_to(matrix.cell_ids())?)
        }
        None => None,
    };

    let genes: Option<Vec<String>> = args.genes.as_ref().map(|g| {
        g.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    let input = DynamicTestInput {
        counts: matrix,
        pseudotime: &table,
        offset: meta.as_ref().and_then(|m| m.offset.as_deref()),
        subject_ids: meta.as_ref().and_then(|m| m.subject_ids.as_deref()),
        genes: genes.as_deref(),
    };
    let results = test_dynamic(input, &config)?;

    write_results_tsv(&results, Path::new(&args.output_file))?;
    info!("Results written to {}", args.output_file);
    if let Some(path) = &args.output_json {
        write_results_json(&results, Path::new(path))?;
        info!("JSON results written to {}", path);
    }
    if let Some(path) = &args.output_results {
        save_results(&results, Path::new(path))?;
        info!("Binary results saved to {}", path);
    }

    println!("{}", results_summary(&results));
    Ok(())
}
