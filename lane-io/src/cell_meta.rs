//! Cell metadata: per-cell offsets and subject ids.
//!
//! A header row names the columns; the cell id column is looked up by
//! name, as are the optional offset and subject columns.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct CellMetadata {
    pub cell_ids: Vec<String>,
    /// Log-scale offset per cell.
    pub offset: Option<Vec<f64>>,
    pub subject_ids: Option<Vec<String>>,
}

/// Column names to pick out of a metadata file.
#[derive(Debug, Clone)]
pub struct MetadataColumns<'a> {
    pub cell_id: &'a str,
    pub offset: Option<&'a str>,
    pub subject: Option<&'a str>,
    /// Take the log of the offset column (size factors given on the raw scale).
    pub log_offset: bool,
}

pub fn read_cell_metadata(path: &Path, columns: &MetadataColumns<'_>) -> Result<CellMetadata> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cell metadata file: {}", path.display()))?;
    let meta = parse_cell_metadata(&contents, columns)?;
    info!(
        "Loaded metadata for {} cells (offset: {}, subjects: {})",
        meta.cell_ids.len(),
        if meta.offset.is_some() { "yes" } else { "no" },
        if meta.subject_ids.is_some() { "yes" } else { "no" },
    );
    Ok(meta)
}

pub fn parse_cell_metadata(contents: &str, columns: &MetadataColumns<'_>) -> Result<CellMetadata> {
    let mut lines = contents.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty cell metadata file"))?;
    let delim = if header.contains('\t') { '\t' } else { ' ' };
    let headers: Vec<&str> = header.split(delim).map(|s| s.trim()).collect();
    let find = |name: &str| {
        headers
            .iter()
            .position(|&h| h == name)
            .ok_or_else(|| anyhow::anyhow!("Column '{}' not found in cell metadata header", name))
    };
    let id_idx = find(columns.cell_id)?;
    let offset_idx = columns.offset.map(find).transpose()?;
    let subject_idx = columns.subject.map(find).transpose()?;

    let mut cell_ids = Vec::new();
    let mut offset = offset_idx.map(|_| Vec::new());
    let mut subjects = subject_idx.map(|_| Vec::new());
    for (line_num, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(delim).map(|s| s.trim()).collect();
        if fields.len() != headers.len() {
            bail!(
                "Line {} has {} fields, expected {}",
                line_num + 2,
                fields.len(),
                headers.len()
            );
        }
        cell_ids.push(fields[id_idx].to_string());
        if let (Some(i), Some(values)) = (offset_idx, offset.as_mut()) {
            let v: f64 = fields[i]
                .parse()
                .with_context(|| format!("Line {}: offset '{}' is not a number", line_num + 2, fields[i]))?;
            let v = if columns.log_offset {
                if v <= 0.0 {
                    bail!("Line {}: size factor {} must be positive", line_num + 2, v);
                }
                v.ln()
            } else {
                v
            };
            values.push(v);
        }
        if let (Some(i), Some(values)) = (subject_idx, subjects.as_mut()) {
            values.push(fields[i].to_string());
        }
    }

    Ok(CellMetadata {
        cell_ids,
        offset,
        subject_ids: subjects,
    })
}

impl CellMetadata {
    /// Reorder to `cell_ids`; every target cell must be present.
    pub fn align_to(&self, cell_ids: &[String]) -> Result<CellMetadata> {
        let position: HashMap<&str, usize> = self
            .cell_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let order = cell_ids
            .iter()
            .map(|id| {
                position
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Cell '{}' has no metadata row", id))
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(CellMetadata {
            cell_ids: cell_ids.to_vec(),
            offset: self.offset.as_ref().map(|o| order.iter().map(|&i| o[i]).collect()),
            subject_ids: self
                .subject_ids
                .as_ref()
                .map(|s| order.iter().map(|&i| s[i].clone()).collect()),
        })
    }
}
