//! Tests of an adaptive spline model against the intercept-only null.
//!
//! LRT for likelihood backends (GLM, GLMM), Wald or Score for GEE. Every
//! test returns a [`TestResult`]; a statistic that cannot be computed is
//! reported as `None` with a note instead of an error.

pub mod lrt;
pub mod score;
pub mod wald;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::backend::{BackendKind, FittedModel};
use crate::data::Series;
use crate::error::InputError;
use crate::marge::MargeModel;

pub use lrt::likelihood_ratio_test;
pub use score::{gee_score_test, ols_probe};
pub use wald::wald_test;

/// Which statistic a result holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestKind {
    Lrt,
    Wald,
    Score,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Lrt => "LRT",
            TestKind::Wald => "Wald",
            TestKind::Score => "Score",
        }
    }

    /// The statistic used for a backend.
    pub fn for_backend(backend: BackendKind, gee_test: GeeTest) -> Self {
        match (backend, gee_test) {
            (BackendKind::Gee, GeeTest::Wald) => TestKind::Wald,
            (BackendKind::Gee, GeeTest::Score) => TestKind::Score,
            _ => TestKind::Lrt,
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GEE test choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeeTest {
    #[default]
    Wald,
    Score,
}

impl FromStr for GeeTest {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wald" => Ok(GeeTest::Wald),
            "score" => Ok(GeeTest::Score),
            _ => Err(InputError::InvalidOption {
                option: "gee_test",
                value: s.to_string(),
                expected: "wald, score",
            }),
        }
    }
}

impl fmt::Display for GeeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GeeTest::Wald => "wald",
            GeeTest::Score => "score",
        })
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub kind: TestKind,
    /// `None` when the statistic is undefined.
    pub statistic: Option<f64>,
    pub df: usize,
    pub p_value: Option<f64>,
    pub note: Option<String>,
}

impl TestResult {
    /// Chi-square referenced result.
    pub fn from_statistic(kind: TestKind, statistic: f64, df: usize) -> Self {
        if !statistic.is_finite() {
            return Self::undefined(kind, df, "non-finite test statistic");
        }
        let statistic = statistic.max(0.0);
        Self {
            kind,
            statistic: Some(statistic),
            df,
            p_value: chi_square_sf(statistic, df),
            note: None,
        }
    }

    pub fn undefined(kind: TestKind, df: usize, note: impl Into<String>) -> Self {
        Self {
            kind,
            statistic: None,
            df,
            p_value: None,
            note: Some(note.into()),
        }
    }

    /// The alternative kept no basis terms: nothing to test.
    pub fn no_terms(kind: TestKind) -> Self {
        Self {
            kind,
            statistic: Some(0.0),
            df: 0,
            p_value: Some(1.0),
            note: Some("no basis terms selected".to_string()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        let note = note.into();
        self.note = Some(match self.note.take() {
            Some(prev) => format!("{}; {}", prev, note),
            None => note,
        });
        self
    }

    pub fn is_defined(&self) -> bool {
        self.statistic.is_some()
    }
}

/// Upper tail of the chi-square distribution; df = 0 gives 1.
pub fn chi_square_sf(statistic: f64, df: usize) -> Option<f64> {
    if df == 0 {
        return Some(1.0);
    }
    let chi2 = ChiSquared::new(df as f64).ok()?;
    Some(chi2.sf(statistic).clamp(0.0, 1.0))
}

/// Run `kind` for an alternative spline model against its null fit.
pub fn run_test(kind: TestKind, alt: &MargeModel, null: &FittedModel, series: &Series) -> TestResult {
    if alt.n_terms() == 0 {
        return TestResult::no_terms(kind);
    }
    let null_cols = null.n_params();
    let mut result = match kind {
        TestKind::Lrt => likelihood_ratio_test(&alt.fit, null),
        TestKind::Wald => {
            let idx: Vec<usize> = (null_cols..alt.fit.n_params()).collect();
            wald_test(&alt.fit, &idx)
        }
        TestKind::Score => gee_score_test(null, series, &alt.design, null_cols),
    };
    if !alt.fit.converged {
        result = result.with_note("alternative model did not converge");
    }
    if !null.converged {
        result = result.with_note("null model did not converge");
    }
    result
}
