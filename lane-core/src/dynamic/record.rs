//! Per-(gene, lineage) records and the ordered result collection.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendAux, BackendKind, FittedModel};
use crate::marge::{BasisTerm, MargeModel};
use crate::testing::{TestKind, TestResult};

/// Processing stage of one (gene, lineage) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    Pending,
    FittingAlt,
    FittingNull,
    Testing,
    Done,
    Error,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::FittingAlt => "fitting_alt",
            UnitState::FittingNull => "fitting_null",
            UnitState::Testing => "testing",
            UnitState::Done => "done",
            UnitState::Error => "error",
        }
    }
}

/// Outcome category of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    Ok,
    /// A backend fit failed; all statistics are undefined.
    FitFailed,
    /// Both fits succeeded but the statistic could not be computed.
    TestUndefined,
    /// The unit panicked or its input could not be read.
    WorkerError,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Ok => "ok",
            UnitStatus::FitFailed => "fit_failed",
            UnitStatus::TestUndefined => "test_undefined",
            UnitStatus::WorkerError => "worker_error",
        }
    }
}

/// What a caller needs to know about one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub n_params: usize,
    pub terms: Vec<BasisTerm>,
    pub coefficients: Vec<f64>,
    pub theta: f64,
    pub log_likelihood: Option<f64>,
    pub deviance: f64,
    pub converged: bool,
    pub iterations: usize,
    pub forward_gcv: Option<f64>,
    pub selected_gcv: Option<f64>,
    /// GEE working correlation parameter.
    pub alpha: Option<f64>,
    /// GEE scale.
    pub phi: Option<f64>,
    /// GLMM random intercept variance.
    pub sigma2: Option<f64>,
}

impl ModelSummary {
    pub fn from_fit(fit: &FittedModel) -> Self {
        let (alpha, phi, sigma2) = match &fit.aux {
            BackendAux::Glm => (None, None, None),
            BackendAux::Gee { alpha, phi, .. } => (Some(*alpha), Some(*phi), None),
            BackendAux::Glmm { sigma2, .. } => (None, None, Some(*sigma2)),
        };
        Self {
            n_params: fit.n_params(),
            terms: Vec::new(),
            coefficients: fit.coefficients.clone(),
            theta: fit.theta,
            log_likelihood: fit.log_likelihood,
            deviance: fit.deviance,
            converged: fit.converged,
            iterations: fit.iterations,
            forward_gcv: None,
            selected_gcv: None,
            alpha,
            phi,
            sigma2,
        }
    }

    pub fn from_marge(model: &MargeModel) -> Self {
        Self {
            terms: model.terms.clone(),
            forward_gcv: Some(model.forward_gcv),
            selected_gcv: Some(model.selected_gcv),
            ..Self::from_fit(&model.fit)
        }
    }

    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    /// Knots as `+0.41;-0.41`.
    pub fn knots_label(&self) -> String {
        self.terms
            .iter()
            .map(|t| format!("{}{:.4}", t.direction.symbol(), t.knot))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Result of one (gene, lineage) unit. Built once, never mutated after the
/// orchestrator attaches adjusted p-values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneLineageRecord {
    pub gene: String,
    pub lineage: String,
    pub n_cells: usize,
    pub alt: Option<ModelSummary>,
    pub null: Option<ModelSummary>,
    pub test: TestResult,
    /// Benjamini-Hochberg adjusted p-value across all records.
    pub p_adj: Option<f64>,
    pub fit_seconds: f64,
    pub status: UnitStatus,
    /// Last state reached: `Done`, or `Error` with `failed_in` set.
    pub state: UnitState,
    pub failed_in: Option<UnitState>,
    pub notes: Vec<String>,
}

impl GeneLineageRecord {
    /// All-undefined record for a unit that could not be completed.
    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        gene: &str,
        lineage: &str,
        n_cells: usize,
        kind: TestKind,
        failed_in: UnitState,
        status: UnitStatus,
        message: String,
        fit_seconds: f64,
    ) -> Self {
        Self {
            gene: gene.to_string(),
            lineage: lineage.to_string(),
            n_cells,
            alt: None,
            null: None,
            test: TestResult::undefined(kind, 0, message.clone()),
            p_adj: None,
            fit_seconds,
            status,
            state: UnitState::Error,
            failed_in: Some(failed_in),
            notes: vec![format!("{}: {}", failed_in.as_str(), message)],
        }
    }

    pub fn p_value(&self) -> Option<f64> {
        self.test.p_value
    }
}

/// All lineage records of one gene, in lineage label order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneResults {
    pub gene: String,
    pub lineages: Vec<GeneLineageRecord>,
}

impl GeneResults {
    pub fn get(&self, lineage: &str) -> Option<&GeneLineageRecord> {
        self.lineages.iter().find(|r| r.lineage == lineage)
    }
}

/// Ordered results of one run: genes in submission order, lineages in
/// label order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTestResults {
    pub magic: [u8; 4],
    pub version: u32,
    pub backend: BackendKind,
    pub test: TestKind,
    pub lineage_labels: Vec<String>,
    pub genes: Vec<GeneResults>,
    pub elapsed_seconds: f64,
}

impl DynamicTestResults {
    pub const MAGIC: [u8; 4] = *b"LNRS";
    pub const VERSION: u32 = 1;

    pub fn new(
        backend: BackendKind,
        test: TestKind,
        lineage_labels: Vec<String>,
        genes: Vec<GeneResults>,
        elapsed_seconds: f64,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            backend,
            test,
            lineage_labels,
            genes,
            elapsed_seconds,
        }
    }

    pub fn gene(&self, gene: &str) -> Option<&GeneResults> {
        self.genes.iter().find(|g| g.gene == gene)
    }

    pub fn get(&self, gene: &str, lineage: &str) -> Option<&GeneLineageRecord> {
        self.gene(gene).and_then(|g| g.get(lineage))
    }

    /// Records in gene order, then lineage order.
    pub fn records(&self) -> impl Iterator<Item = &GeneLineageRecord> {
        self.genes.iter().flat_map(|g| g.lineages.iter())
    }

    pub fn n_records(&self) -> usize {
        self.genes.iter().map(|g| g.lineages.len()).sum()
    }

    pub fn count_status(&self, status: UnitStatus) -> usize {
        self.records().filter(|r| r.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_record_is_all_undefined() {
        let r = GeneLineageRecord::failed(
            "g1",
            "Lineage_A",
            12,
            TestKind::Lrt,
            UnitState::FittingAlt,
            UnitStatus::FitFailed,
            "response is all zero".to_string(),
            0.01,
        );
        assert_eq!(r.state, UnitState::Error);
        assert!(r.test.statistic.is_none() && r.test.p_value.is_none());
        assert!(r.alt.is_none() && r.null.is_none());
        assert_eq!(r.notes, vec!["fitting_alt: response is all zero".to_string()]);
    }
}
