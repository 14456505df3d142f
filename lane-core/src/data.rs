//! Input data model: count sources, pseudotime tables, subject grouping and
//! the per-(gene, lineage) `Series` handed to the model search.

use std::ops::Range;

use anyhow::Result;

use crate::error::InputError;

/// Read-only access to a genes x cells count matrix.
///
/// Implementations must be shareable across worker threads; the
/// orchestrator only ever reads through this trait.
pub trait CountSource: Sync {
    /// Number of genes (rows).
    fn n_genes(&self) -> usize;

    /// Number of cells (columns).
    fn n_cells(&self) -> usize;

    /// Gene identifiers in row order.
    fn gene_ids(&self) -> &[String];

    /// Read the counts of `gene` at the listed cell indices into `out`
    /// (cleared first), preserving the order of `cells`.
    fn read_cells(&self, gene: usize, cells: &[usize], out: &mut Vec<f64>) -> Result<()>;

    /// Check every entry is a finite, non-negative integer.
    fn validate(&self) -> Result<(), InputError> {
        if self.n_genes() == 0 || self.n_cells() == 0 {
            return Err(InputError::EmptyCounts);
        }
        let all: Vec<usize> = (0..self.n_cells()).collect();
        let mut row = Vec::with_capacity(all.len());
        for g in 0..self.n_genes() {
            self.read_cells(g, &all, &mut row)
                .map_err(|e| InputError::CountRead(e.to_string()))?;
            if let Some((cell, &value)) = row
                .iter()
                .enumerate()
                .find(|(_, &v)| !v.is_finite() || v < 0.0 || v.fract() != 0.0)
            {
                return Err(InputError::InvalidCount {
                    gene: self.gene_ids()[g].clone(),
                    cell,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Dense in-memory counts, row-major (one row per gene).
#[derive(Debug, Clone)]
pub struct InMemoryCounts {
    gene_ids: Vec<String>,
    n_cells: usize,
    data: Vec<f64>,
}

impl InMemoryCounts {
    pub fn new(gene_ids: Vec<String>, n_cells: usize, data: Vec<f64>) -> Result<Self, InputError> {
        let expected = gene_ids.len() * n_cells;
        if data.len() != expected {
            return Err(InputError::LengthMismatch {
                what: "count matrix data",
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            gene_ids,
            n_cells,
            data,
        })
    }

    /// Build from one vector per gene.
    pub fn from_rows(gene_ids: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self, InputError> {
        let n_cells = rows.first().map_or(0, |r| r.len());
        if rows.len() != gene_ids.len() {
            return Err(InputError::LengthMismatch {
                what: "count matrix rows",
                expected: gene_ids.len(),
                got: rows.len(),
            });
        }
        let mut data = Vec::with_capacity(rows.len() * n_cells);
        for row in rows {
            if row.len() != n_cells {
                return Err(InputError::LengthMismatch {
                    what: "count matrix row",
                    expected: n_cells,
                    got: row.len(),
                });
            }
            data.extend(row);
        }
        Self::new(gene_ids, n_cells, data)
    }
}

impl CountSource for InMemoryCounts {
    fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    fn n_cells(&self) -> usize {
        self.n_cells
    }

    fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    fn read_cells(&self, gene: usize, cells: &[usize], out: &mut Vec<f64>) -> Result<()> {
        if gene >= self.gene_ids.len() {
            anyhow::bail!("gene index {} out of range ({} genes)", gene, self.gene_ids.len());
        }
        let row = &self.data[gene * self.n_cells..(gene + 1) * self.n_cells];
        out.clear();
        for &c in cells {
            let v = row
                .get(c)
                .ok_or_else(|| anyhow::anyhow!("cell index {} out of range", c))?;
            out.push(*v);
        }
        Ok(())
    }
}

/// Label for the lineage in column `index`: Lineage_A, Lineage_B, ...,
/// Lineage_Z, Lineage_AA, ...
pub fn lineage_label(index: usize) -> String {
    let mut letters = Vec::new();
    let mut i = index + 1;
    while i > 0 {
        let rem = (i - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        i = (i - 1) / 26;
    }
    letters.reverse();
    format!("Lineage_{}", letters.into_iter().collect::<String>())
}

/// Pseudotime values, one column per lineage, `None` for cells off a lineage.
#[derive(Debug, Clone)]
pub struct PseudotimeTable {
    cell_ids: Vec<String>,
    labels: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
}

impl PseudotimeTable {
    /// Build a table; column labels are normalized to `Lineage_A, Lineage_B, ...`
    /// in column order. NaN entries are treated as missing.
    pub fn new(cell_ids: Vec<String>, columns: Vec<Vec<Option<f64>>>) -> Result<Self, InputError> {
        if columns.is_empty() {
            return Err(InputError::NoLineages);
        }
        for col in &columns {
            if col.len() != cell_ids.len() {
                return Err(InputError::LengthMismatch {
                    what: "pseudotime column",
                    expected: cell_ids.len(),
                    got: col.len(),
                });
            }
        }
        let columns: Vec<Vec<Option<f64>>> = columns
            .into_iter()
            .map(|col| col.into_iter().map(|v| v.filter(|x| !x.is_nan())).collect())
            .collect();
        let labels = (0..columns.len()).map(lineage_label).collect();
        Ok(Self {
            cell_ids,
            labels,
            columns,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn n_lineages(&self) -> usize {
        self.columns.len()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Cells on `lineage` (in table order) and their pseudotime values.
    pub fn lineage_cells(&self, lineage: usize) -> (Vec<usize>, Vec<f64>) {
        self.columns[lineage]
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|t| (i, t)))
            .unzip()
    }

    pub(crate) fn validate(&self) -> Result<(), InputError> {
        for (l, col) in self.columns.iter().enumerate() {
            let mut any = false;
            for (cell, v) in col.iter().enumerate() {
                if let Some(t) = v {
                    if !t.is_finite() {
                        return Err(InputError::InvalidPseudotime {
                            label: self.labels[l].clone(),
                            cell,
                            value: *t,
                        });
                    }
                    any = true;
                }
            }
            if !any {
                return Err(InputError::EmptyLineage {
                    label: self.labels[l].clone(),
                });
            }
        }
        Ok(())
    }
}

/// Contiguous blocks of observations sharing a subject id.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectGroups {
    ranges: Vec<Range<usize>>,
}

impl SubjectGroups {
    /// Build groups from subject ids that must be non-decreasing.
    pub fn from_sorted_ids<S: AsRef<str>>(ids: &[S]) -> Result<Self, InputError> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for i in 1..ids.len() {
            let (prev, cur) = (ids[i - 1].as_ref(), ids[i].as_ref());
            if cur < prev {
                return Err(InputError::UnsortedSubjectIds {
                    position: i,
                    previous: prev.to_string(),
                    current: cur.to_string(),
                });
            }
            if cur != prev {
                ranges.push(start..i);
                start = i;
            }
        }
        if !ids.is_empty() {
            ranges.push(start..ids.len());
        }
        Ok(Self { ranges })
    }

    /// Observation ranges, one per subject.
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub fn n_groups(&self) -> usize {
        self.ranges.len()
    }

    pub fn n_obs(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn max_size(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Group index of every observation.
    pub fn membership(&self) -> Vec<usize> {
        let mut m = vec![0; self.n_obs()];
        for (g, r) in self.ranges.iter().enumerate() {
            for slot in &mut m[r.clone()] {
                *slot = g;
            }
        }
        m
    }
}

/// One count series along one lineage: response, pseudotime, optional
/// offset and optional subject grouping, all index-aligned.
#[derive(Debug, Clone)]
pub struct Series {
    pub response: Vec<f64>,
    pub pseudotime: Vec<f64>,
    pub offset: Option<Vec<f64>>,
    pub groups: Option<SubjectGroups>,
}

impl Series {
    pub fn new(
        response: Vec<f64>,
        pseudotime: Vec<f64>,
        offset: Option<Vec<f64>>,
        groups: Option<SubjectGroups>,
    ) -> Result<Self, InputError> {
        let n = response.len();
        if pseudotime.len() != n {
            return Err(InputError::LengthMismatch {
                what: "pseudotime",
                expected: n,
                got: pseudotime.len(),
            });
        }
        if let Some(o) = &offset {
            if o.len() != n {
                return Err(InputError::LengthMismatch {
                    what: "offset",
                    expected: n,
                    got: o.len(),
                });
            }
        }
        if let Some(g) = &groups {
            if g.n_obs() != n {
                return Err(InputError::LengthMismatch {
                    what: "subject ids",
                    expected: n,
                    got: g.n_obs(),
                });
            }
        }
        Ok(Self {
            response,
            pseudotime,
            offset,
            groups,
        })
    }

    pub fn len(&self) -> usize {
        self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }

    /// Offset vector, zeros when none was supplied.
    pub fn offset_or_zero(&self) -> Vec<f64> {
        self.offset.clone().unwrap_or_else(|| vec![0.0; self.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_labels() {
        assert_eq!(lineage_label(0), "Lineage_A");
        assert_eq!(lineage_label(1), "Lineage_B");
        assert_eq!(lineage_label(25), "Lineage_Z");
        assert_eq!(lineage_label(26), "Lineage_AA");
    }

    #[test]
    fn test_subject_groups() {
        let g = SubjectGroups::from_sorted_ids(&["a", "a", "b", "c", "c", "c"]).unwrap();
        assert_eq!(g.n_groups(), 3);
        assert_eq!(g.ranges()[2], 3..6);
        assert_eq!(g.max_size(), 3);
        assert_eq!(g.membership(), vec![0, 0, 1, 2, 2, 2]);
    }

    #[test]
    fn test_unsorted_subjects_rejected() {
        let err = SubjectGroups::from_sorted_ids(&["a", "b", "a"]).unwrap_err();
        assert!(matches!(err, InputError::UnsortedSubjectIds { position: 2, .. }));
    }

    #[test]
    fn test_pseudotime_lineage_cells() {
        let pt = PseudotimeTable::new(
            vec!["c1".into(), "c2".into(), "c3".into()],
            vec![
                vec![Some(0.1), None, Some(0.5)],
                vec![None, Some(f64::NAN), Some(0.2)],
            ],
        )
        .unwrap();
        assert_eq!(pt.labels(), &["Lineage_A".to_string(), "Lineage_B".to_string()]);
        assert_eq!(pt.lineage_cells(0), (vec![0, 2], vec![0.1, 0.5]));
        assert_eq!(pt.lineage_cells(1), (vec![2], vec![0.2]));
    }

    #[test]
    fn test_in_memory_counts_validation() {
        let counts = InMemoryCounts::from_rows(
            vec!["g1".into(), "g2".into()],
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 1.5, 0.0]],
        )
        .unwrap();
        let err = counts.validate().unwrap_err();
        assert!(matches!(err, InputError::InvalidCount { cell: 1, .. }));

        let mut out = Vec::new();
        counts.read_cells(0, &[2, 0], &mut out).unwrap();
        assert_eq!(out, vec![2.0, 0.0]);
    }

    #[test]
    fn test_series_length_check() {
        let err = Series::new(vec![1.0, 2.0], vec![0.0], None, None).unwrap_err();
        assert!(matches!(err, InputError::LengthMismatch { what: "pseudotime", .. }));
    }
}
