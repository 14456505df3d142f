//! Pseudotime table reader.
//!
//! One row per cell: the cell id, then one pseudotime column per lineage.
//! `NA`, `.` or an empty field marks a cell that is not on a lineage.
//! Column names are replaced by `Lineage_A, Lineage_B, ...` in column order.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use lane_core::data::PseudotimeTable;

fn parse_time(s: &str) -> Result<Option<f64>> {
    match s {
        "NA" | "na" | "Na" | "." | "" | "NaN" | "nan" => Ok(None),
        _ => Ok(Some(
            s.parse::<f64>()
                .with_context(|| format!("'{}' is not a pseudotime value", s))?,
        )),
    }
}

pub fn read_pseudotime(path: &Path) -> Result<PseudotimeTable> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pseudotime file: {}", path.display()))?;
    let table = parse_pseudotime(&contents)?;
    info!(
        "Loaded pseudotime for {} cells across {} lineages",
        table.n_cells(),
        table.n_lineages()
    );
    Ok(table)
}

pub fn parse_pseudotime(contents: &str) -> Result<PseudotimeTable> {
    let mut lines = contents.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty pseudotime file"))?;
    let delim = if header.contains('\t') { '\t' } else { ' ' };
    let n_lineages = header.split(delim).count().saturating_sub(1);
    if n_lineages == 0 {
        bail!("Pseudotime header has no lineage columns");
    }

    let mut cell_ids = Vec::new();
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); n_lineages];
    for (line_num, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(delim).map(|s| s.trim()).collect();
        if fields.len() != n_lineages + 1 {
            bail!(
                "Line {} has {} fields, expected {}",
                line_num + 2,
                fields.len(),
                n_lineages + 1
            );
        }
        cell_ids.push(fields[0].to_string());
        for (col, field) in columns.iter_mut().zip(&fields[1..]) {
            col.push(parse_time(field).with_context(|| format!("Line {}", line_num + 2))?);
        }
    }
    if cell_ids.is_empty() {
        bail!("Pseudotime file has no cells");
    }
    Ok(PseudotimeTable::new(cell_ids, columns)?)
}

/// Re-index `table` to `cell_ids` (the count matrix's cell order). Cells
/// missing from the table are off every lineage; table cells absent from
/// `cell_ids` are an error.
pub fn align_pseudotime(table: &PseudotimeTable, cell_ids: &[String]) -> Result<PseudotimeTable> {
    let position: HashMap<&str, usize> = cell_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    if position.len() != cell_ids.len() {
        bail!("Count matrix cell ids are not unique");
    }
    let mut target = Vec::with_capacity(table.n_cells());
    for id in table.cell_ids() {
        match position.get(id.as_str()) {
            Some(&i) => target.push(i),
            None => bail!("Cell '{}' in the pseudotime table is not in the count matrix", id),
        }
    }
    let columns = (0..table.n_lineages())
        .map(|l| {
            let mut col = vec![None; cell_ids.len()];
            let (cells, times) = table.lineage_cells(l);
            for (c, t) in cells.into_iter().zip(times) {
                col[target[c]] = Some(t);
            }
            col
        })
        .collect();
    Ok(PseudotimeTable::new(cell_ids.to_vec(), columns)?)
}
