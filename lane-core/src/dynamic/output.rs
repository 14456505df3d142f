//! Result writers: tab-separated table, JSON, and a bincode results file.
//!
//! Binary format: bincode payload of [`DynamicTestResults`] whose leading
//! magic bytes (`LNRS`) and version are checked on load.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::record::{DynamicTestResults, GeneLineageRecord};

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{}", v),
        _ => "NA".to_string(),
    }
}

pub fn write_results_header(writer: &mut impl Write) -> Result<()> {
    writeln!(
        writer,
        "gene\tlineage\tn_cells\ttest\tstatistic\tdf\tp_value\tp_adj\tn_terms\tknots\ttheta_alt\tloglik_alt\tloglik_null\tconverged\tstatus\tfit_seconds\tnotes"
    )?;
    Ok(())
}

/// One row per (gene, lineage).
pub fn write_record_line(writer: &mut impl Write, record: &GeneLineageRecord) -> Result<()> {
    let alt = record.alt.as_ref();
    let null = record.null.as_ref();
    let converged = match (alt, null) {
        (Some(a), Some(n)) => (a.converged && n.converged).to_string(),
        _ => "NA".to_string(),
    };
    writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.4}\t{}",
        record.gene,
        record.lineage,
        record.n_cells,
        record.test.kind,
        fmt_opt(record.test.statistic),
        record.test.df,
        fmt_opt(record.test.p_value),
        fmt_opt(record.p_adj),
        alt.map_or_else(|| "NA".to_string(), |a| a.n_terms().to_string()),
        alt.map_or_else(|| "NA".to_string(), |a| a.knots_label()),
        fmt_opt(alt.map(|a| a.theta)),
        fmt_opt(alt.and_then(|a| a.log_likelihood)),
        fmt_opt(null.and_then(|n| n.log_likelihood)),
        converged,
        record.status.as_str(),
        record.fit_seconds,
        if record.notes.is_empty() {
            "NA".to_string()
        } else {
            record.notes.join("; ")
        },
    )?;
    Ok(())
}

pub fn write_results_tsv(results: &DynamicTestResults, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_results_header(&mut writer)?;
    for record in results.records() {
        write_record_line(&mut writer, record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_results_json(results: &DynamicTestResults, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn save_results(results: &DynamicTestResults, path: &Path) -> Result<()> {
    let encoded = bincode::serialize(results)?;
    std::fs::write(path, &encoded).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn load_results(path: &Path) -> Result<DynamicTestResults> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let results: DynamicTestResults = bincode::deserialize(&data)?;
    if results.magic != DynamicTestResults::MAGIC {
        bail!(
            "Invalid results file: expected magic bytes {:?}, got {:?}",
            DynamicTestResults::MAGIC,
            results.magic
        );
    }
    if results.version != DynamicTestResults::VERSION {
        bail!(
            "Unsupported results version {} (expected {})",
            results.version,
            DynamicTestResults::VERSION
        );
    }
    Ok(results)
}

/// Short human-readable summary of a run.
pub fn results_summary(results: &DynamicTestResults) -> String {
    use super::record::UnitStatus;
    let significant = results
        .records()
        .filter(|r| r.p_adj.map_or(false, |p| p < 0.05))
        .count();
    format!(
        "Dynamic test results v{}\n\
         Backend: {} ({} test)\n\
         Genes: {}\n\
         Lineages: {} [{}]\n\
         Records: {} ok, {} fit failed, {} test undefined, {} worker errors\n\
         Adjusted p < 0.05: {}\n\
         Elapsed: {:.2}s",
        results.version,
        results.backend,
        results.test,
        results.genes.len(),
        results.lineage_labels.len(),
        results.lineage_labels.join(", "),
        results.count_status(UnitStatus::Ok),
        results.count_status(UnitStatus::FitFailed),
        results.count_status(UnitStatus::TestUndefined),
        results.count_status(UnitStatus::WorkerError),
        significant,
        results.elapsed_seconds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::dynamic::record::{GeneResults, UnitState, UnitStatus};
    use crate::testing::{TestKind, TestResult};

    fn sample() -> DynamicTestResults {
        let mut ok = GeneLineageRecord::failed(
            "g1",
            "Lineage_A",
            40,
            TestKind::Lrt,
            UnitState::Testing,
            UnitStatus::Ok,
            String::new(),
            0.5,
        );
        ok.test = TestResult::from_statistic(TestKind::Lrt, 12.0, 2);
        ok.state = UnitState::Done;
        ok.failed_in = None;
        ok.notes.clear();
        ok.p_adj = ok.test.p_value;
        let bad = GeneLineageRecord::failed(
            "g1",
            "Lineage_B",
            40,
            TestKind::Lrt,
            UnitState::FittingAlt,
            UnitStatus::FitFailed,
            "response is all zero".into(),
            0.1,
        );
        DynamicTestResults::new(
            BackendKind::Glm,
            TestKind::Lrt,
            vec!["Lineage_A".into(), "Lineage_B".into()],
            vec![GeneResults {
                gene: "g1".into(),
                lineages: vec![ok, bad],
            }],
            1.25,
        )
    }

    #[test]
    fn test_save_load_roundtrip() {
        let results = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lnrs");
        save_results(&results, &path).unwrap();
        let loaded = load_results(&path).unwrap();
        assert_eq!(loaded, results);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mut results = sample();
        results.magic = *b"XXXX";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.lnrs");
        save_results(&results, &path).unwrap();
        assert!(load_results(&path).is_err());
    }

    #[test]
    fn test_tsv_lines() {
        let results = sample();
        let mut buf = Vec::new();
        write_results_header(&mut buf).unwrap();
        for r in results.records() {
            write_record_line(&mut buf, r).unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let ncol = lines[0].split('\t').count();
        assert!(lines.iter().all(|l| l.split('\t').count() == ncol));
        assert!(lines[1].starts_with("g1\tLineage_A\t40\tLRT\t12\t2\t"));
        assert!(lines[2].contains("fit_failed"));
    }

    #[test]
    fn test_summary_mentions_backend() {
        let s = results_summary(&sample());
        assert!(s.contains("Backend: glm (LRT test)"));
        assert!(s.contains("1 ok, 1 fit failed"));
    }
}
