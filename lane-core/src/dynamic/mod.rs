//! Trajectory testing over many genes and lineages.
//!
//! `test_dynamic` validates every input up front, then runs one task per
//! gene (all of its lineages in label order) either on the caller thread or
//! on a rayon pool built for the call. Each (gene, lineage) unit moves
//! through `Pending -> FittingAlt -> FittingNull -> Testing -> Done`; any
//! failure, including a panic, turns into an all-undefined record and never
//! stops the batch.

pub mod output;
pub mod record;
pub mod seed;

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use lane_linalg::dense::DenseMatrix;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendKind, BiasCorrection, CorrelationStructure, FitFailure, GeeConfig, GlmConfig, GlmmConfig,
};
use crate::data::{CountSource, PseudotimeTable, Series, SubjectGroups};
use crate::error::InputError;
use crate::marge::{self, MargeConfig, MargeModel};
use crate::testing::{run_test, GeeTest, TestKind};
use crate::util::math::benjamini_hochberg;

pub use record::{DynamicTestResults, GeneLineageRecord, GeneResults, ModelSummary, UnitState, UnitStatus};
pub use seed::gene_rng;

/// Settings for one `test_dynamic` invocation.
#[derive(Debug, Clone)]
pub struct DynamicTestConfig {
    pub backend: BackendKind,
    /// GEE working correlation.
    pub cor_structure: CorrelationStructure,
    /// GEE sandwich small-sample correction.
    pub bias_correction: BiasCorrection,
    pub gee_test: GeeTest,
    /// Adaptive knot search for GLMM; fixed knots otherwise.
    pub glmm_adaptive: bool,
    pub max_terms: usize,
    pub approx_knot: bool,
    pub n_workers: usize,
    pub seed: u64,
    /// Log progress at `info` instead of `debug`.
    pub verbose: bool,
    /// Lineages with fewer cells are reported as fit failures.
    pub min_cells: usize,
    pub glm: GlmConfig,
    pub gee: GeeConfig,
    pub glmm: GlmmConfig,
}

impl Default for DynamicTestConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Glm,
            cor_structure: CorrelationStructure::default(),
            bias_correction: BiasCorrection::default(),
            gee_test: GeeTest::default(),
            glmm_adaptive: true,
            max_terms: 5,
            approx_knot: false,
            n_workers: 1,
            seed: 312,
            verbose: false,
            min_cells: 10,
            glm: GlmConfig::default(),
            gee: GeeConfig::default(),
            glmm: GlmmConfig::default(),
        }
    }
}

impl DynamicTestConfig {
    pub fn validate(&self) -> Result<(), InputError> {
        let checks: [(&'static str, &'static str, usize, usize); 3] = [
            ("max_terms", "at least 1", self.max_terms, 1),
            ("n_workers", "at least 1", self.n_workers, 1),
            ("min_cells", "at least 2", self.min_cells, 2),
        ];
        for (option, requirement, value, min) in checks {
            if value < min {
                return Err(InputError::OutOfRange {
                    option,
                    requirement,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The backend selected for this run, with the GEE options applied.
    pub fn backend(&self) -> Backend {
        match self.backend {
            BackendKind::Glm => Backend::Glm(self.glm.clone()),
            BackendKind::Gee => Backend::Gee(GeeConfig {
                correlation: self.cor_structure,
                bias_correction: self.bias_correction,
                glm: self.glm.clone(),
                ..self.gee.clone()
            }),
            BackendKind::Glmm => Backend::Glmm(GlmmConfig {
                glm: self.glm.clone(),
                ..self.glmm.clone()
            }),
        }
    }

    pub fn marge_config(&self) -> MargeConfig {
        MargeConfig {
            max_terms: self.max_terms,
            approx_knot: self.approx_knot,
            ..MargeConfig::default()
        }
    }

    pub fn test_kind(&self) -> TestKind {
        TestKind::for_backend(self.backend, self.gee_test)
    }

    fn uses_fixed_knots(&self) -> bool {
        self.backend == BackendKind::Glmm && !self.glmm_adaptive
    }
}

/// Inputs of one run. Cells are indexed identically in the counts, the
/// pseudotime table, the offset and the subject ids.
#[derive(Clone, Copy)]
pub struct DynamicTestInput<'a> {
    pub counts: &'a dyn CountSource,
    pub pseudotime: &'a PseudotimeTable,
    pub offset: Option<&'a [f64]>,
    /// Required for GEE and GLMM; must be sorted so subjects are contiguous.
    pub subject_ids: Option<&'a [String]>,
    /// Genes to test, in output order. All genes when `None`.
    pub genes: Option<&'a [String]>,
}

/// Cells of one lineage and the per-cell data every gene shares.
#[derive(Debug)]
struct LineagePlan {
    label: String,
    cells: Vec<usize>,
    pseudotime: Vec<f64>,
    offset: Option<Vec<f64>>,
    groups: Option<SubjectGroups>,
}

#[derive(Debug, Clone)]
struct GeneTask {
    /// Position in the output.
    index: usize,
    /// Row in the count source.
    row: usize,
    id: String,
}

struct RunContext<'a> {
    counts: &'a dyn CountSource,
    plans: &'a [LineagePlan],
    backend: Backend,
    kind: TestKind,
    marge: MargeConfig,
    config: &'a DynamicTestConfig,
    completed: AtomicUsize,
    n_genes: usize,
}

/// Test every requested gene along every lineage.
///
/// Input problems are returned as errors before any gene is processed;
/// per-unit failures are recorded in the results.
pub fn test_dynamic(input: DynamicTestInput<'_>, config: &DynamicTestConfig) -> Result<DynamicTestResults, InputError> {
    let start = Instant::now();
    config.validate()?;
    input.counts.validate()?;
    input.pseudotime.validate()?;

    let plans = plan_lineages(&input, config.backend)?;
    let tasks = gene_tasks(input.counts, input.genes)?;
    let kind = config.test_kind();

    info!(
        "Testing {} genes x {} lineages with the {} backend ({} test, {} worker{})",
        tasks.len(),
        plans.len(),
        config.backend,
        kind,
        config.n_workers,
        if config.n_workers == 1 { "" } else { "s" }
    );

    let ctx = RunContext {
        counts: input.counts,
        plans: &plans,
        backend: config.backend(),
        kind,
        marge: config.marge_config(),
        config,
        completed: AtomicUsize::new(0),
        n_genes: tasks.len(),
    };

    let mut genes: Vec<GeneResults> = if config.n_workers == 1 {
        tasks.iter().map(|t| run_gene(t, &ctx)).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_workers)
            .build()
            .map_err(|e| InputError::WorkerPool(e.to_string()))?;
        pool.install(|| tasks.par_iter().map(|t| run_gene(t, &ctx)).collect::<Vec<_>>())
    };

    adjust_pvalues(&mut genes);

    let results = DynamicTestResults::new(
        config.backend,
        kind,
        plans.iter().map(|p| p.label.clone()).collect(),
        genes,
        start.elapsed().as_secs_f64(),
    );
    info!(
        "Tested {} genes across {} lineages in {:.2}s ({} backend): {} ok, {} fit failures, {} undefined tests, {} worker errors",
        results.genes.len(),
        results.lineage_labels.len(),
        results.elapsed_seconds,
        results.backend,
        results.count_status(UnitStatus::Ok),
        results.count_status(UnitStatus::FitFailed),
        results.count_status(UnitStatus::TestUndefined),
        results.count_status(UnitStatus::WorkerError),
    );
    if let Some(summary) = failure_summary(&results) {
        warn!("{}", summary);
    }
    Ok(results)
}

/// One line covering every unit that did not produce a test, or `None` when
/// all units succeeded. Individual failures are logged at debug level.
pub fn failure_summary(results: &DynamicTestResults) -> Option<String> {
    let failed: Vec<&GeneLineageRecord> = results.records().filter(|r| r.status != UnitStatus::Ok).collect();
    if failed.is_empty() {
        return None;
    }
    let examples: Vec<String> = failed
        .iter()
        .take(3)
        .map(|r| format!("{} / {}", r.gene, r.lineage))
        .collect();
    Some(format!(
        "{} of {} units failed ({} fit failures, {} undefined tests, {} worker errors), e.g. {}; rerun with -vv for details",
        failed.len(),
        results.records().count(),
        results.count_status(UnitStatus::FitFailed),
        results.count_status(UnitStatus::TestUndefined),
        results.count_status(UnitStatus::WorkerError),
        examples.join(", ")
    ))
}

/// Benjamini-Hochberg adjustment across every record of the run.
pub fn adjust_pvalues(genes: &mut [GeneResults]) {
    let pvalues: Vec<Option<f64>> = genes
        .iter()
        .flat_map(|g| g.lineages.iter().map(|r| r.p_value()))
        .collect();
    let adjusted = benjamini_hochberg(&pvalues);
    for (record, p_adj) in genes.iter_mut().flat_map(|g| g.lineages.iter_mut()).zip(adjusted) {
        record.p_adj = p_adj;
    }
}

fn plan_lineages(input: &DynamicTestInput<'_>, backend: BackendKind) -> Result<Vec<LineagePlan>, InputError> {
    let n_cells = input.counts.n_cells();
    if input.pseudotime.n_cells() != n_cells {
        return Err(InputError::LengthMismatch {
            what: "pseudotime cells",
            expected: n_cells,
            got: input.pseudotime.n_cells(),
        });
    }
    if let Some(offset) = input.offset {
        if offset.len() != n_cells {
            return Err(InputError::LengthMismatch {
                what: "offset",
                expected: n_cells,
                got: offset.len(),
            });
        }
        if let Some((cell, &value)) = offset.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(InputError::InvalidOffset { cell, value });
        }
    }
    match input.subject_ids {
        Some(ids) => {
            if ids.len() != n_cells {
                return Err(InputError::LengthMismatch {
                    what: "subject ids",
                    expected: n_cells,
                    got: ids.len(),
                });
            }
            SubjectGroups::from_sorted_ids(ids)?;
        }
        None if backend.requires_groups() => {
            return Err(InputError::MissingSubjectIds {
                backend: backend.to_string(),
            });
        }
        None => {}
    }

    let mut plans = Vec::with_capacity(input.pseudotime.n_lineages());
    for (l, label) in input.pseudotime.labels().iter().enumerate() {
        let (cells, pseudotime) = input.pseudotime.lineage_cells(l);
        let offset = input.offset.map(|o| cells.iter().map(|&c| o[c]).collect());
        // Only grouping backends use the subject structure.
        let groups = match input.subject_ids {
            Some(ids) if backend.requires_groups() => {
                let subset: Vec<&str> = cells.iter().map(|&c| ids[c].as_str()).collect();
                Some(SubjectGroups::from_sorted_ids(&subset)?)
            }
            _ => None,
        };
        debug!("{}: {} cells", label, cells.len());
        plans.push(LineagePlan {
            label: label.clone(),
            cells,
            pseudotime,
            offset,
            groups,
        });
    }
    Ok(plans)
}

fn gene_tasks(counts: &dyn CountSource, genes: Option<&[String]>) -> Result<Vec<GeneTask>, InputError> {
    let ids = counts.gene_ids();
    match genes {
        None => Ok(ids
            .iter()
            .enumerate()
            .map(|(i, id)| GeneTask {
                index: i,
                row: i,
                id: id.clone(),
            })
            .collect()),
        Some(requested) => requested
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let row = ids
                    .iter()
                    .position(|id| id == name)
                    .ok_or_else(|| InputError::UnknownGene(name.clone()))?;
                Ok(GeneTask {
                    index,
                    row,
                    id: name.clone(),
                })
            })
            .collect(),
    }
}

fn run_gene(task: &GeneTask, ctx: &RunContext<'_>) -> GeneResults {
    let mut rng = gene_rng(ctx.config.seed, task.index);
    let lineages = ctx
        .plans
        .iter()
        .map(|plan| {
            let start = Instant::now();
            let state = Cell::new(UnitState::Pending);
            let outcome = catch_unwind(AssertUnwindSafe(|| run_unit(task, plan, ctx, &mut rng, &state, start)));
            outcome.unwrap_or_else(|payload| {
                let message = format!("worker panicked: {}", panic_message(payload.as_ref()));
                debug!("{} / {}: {}", task.id, plan.label, message);
                GeneLineageRecord::failed(
                    &task.id,
                    &plan.label,
                    plan.cells.len(),
                    ctx.kind,
                    state.get(),
                    UnitStatus::WorkerError,
                    message,
                    start.elapsed().as_secs_f64(),
                )
            })
        })
        .collect();

    let done = ctx.completed.fetch_add(1, Ordering::Relaxed) + 1;
    let step = (ctx.n_genes / 10).max(1);
    if done % step == 0 || done == ctx.n_genes {
        if ctx.config.verbose {
            info!("Progress: {}/{} genes", done, ctx.n_genes);
        } else {
            debug!("Progress: {}/{} genes", done, ctx.n_genes);
        }
    }

    GeneResults {
        gene: task.id.clone(),
        lineages,
    }
}

fn run_unit(
    task: &GeneTask,
    plan: &LineagePlan,
    ctx: &RunContext<'_>,
    rng: &mut ChaCha8Rng,
    state: &Cell<UnitState>,
    start: Instant,
) -> GeneLineageRecord {
    let n_cells = plan.cells.len();
    let fail = |status: UnitStatus, message: String| {
        debug!("{} / {}: {} in {}", task.id, plan.label, message, state.get().as_str());
        GeneLineageRecord::failed(
            &task.id,
            &plan.label,
            n_cells,
            ctx.kind,
            state.get(),
            status,
            message,
            start.elapsed().as_secs_f64(),
        )
    };

    let mut response = Vec::with_capacity(n_cells);
    if let Err(e) = ctx.counts.read_cells(task.row, &plan.cells, &mut response) {
        return fail(UnitStatus::WorkerError, format!("reading counts: {:#}", e));
    }
    let series = match Series::new(response, plan.pseudotime.clone(), plan.offset.clone(), plan.groups.clone()) {
        Ok(s) => s,
        Err(e) => return fail(UnitStatus::WorkerError, e.to_string()),
    };

    state.set(UnitState::FittingAlt);
    if n_cells < ctx.config.min_cells {
        let e = FitFailure::TooFewObservations {
            n: n_cells,
            p: ctx.config.min_cells,
        };
        return fail(UnitStatus::FitFailed, e.to_string());
    }
    let alt = match fit_alternative(&series, ctx, rng) {
        Ok(m) => m,
        Err(e) => return fail(UnitStatus::FitFailed, e.to_string()),
    };

    state.set(UnitState::FittingNull);
    let null = match ctx.backend.fit(&DenseMatrix::intercept(series.len()), &series) {
        Ok(f) => f,
        Err(e) => return fail(UnitStatus::FitFailed, e.to_string()),
    };

    state.set(UnitState::Testing);
    let test = run_test(ctx.kind, &alt, &null, &series);
    let status = if test.is_defined() {
        UnitStatus::Ok
    } else {
        UnitStatus::TestUndefined
    };
    let mut notes = Vec::new();
    if let Some(note) = &test.note {
        notes.push(note.clone());
    }
    state.set(UnitState::Done);

    GeneLineageRecord {
        gene: task.id.clone(),
        lineage: plan.label.clone(),
        n_cells,
        alt: Some(ModelSummary::from_marge(&alt)),
        null: Some(ModelSummary::from_fit(&null)),
        test,
        p_adj: None,
        fit_seconds: start.elapsed().as_secs_f64(),
        status,
        state: UnitState::Done,
        failed_in: None,
        notes,
    }
}

fn fit_alternative(series: &Series, ctx: &RunContext<'_>, rng: &mut ChaCha8Rng) -> Result<MargeModel, FitFailure> {
    if ctx.config.uses_fixed_knots() {
        marge::fit_fixed_knots(series, &ctx.backend, ctx.marge.max_terms, ctx.marge.penalty)
    } else {
        marge::fit_marge(series, &ctx.backend, &ctx.marge, rng)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
