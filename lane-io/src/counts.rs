//! Memory-mapped count matrix (LNCM format) and TSV conversion.
//!
//! LNCM layout, all integers little-endian:
//! - header: magic `LNCM`, version (u32), n_genes (u64), n_cells (u64)
//! - payload: n_genes x n_cells `f64`, row-major (one row per gene)
//! - trailer: n_cells cell ids then n_genes gene ids, each a u32 byte
//!   length followed by UTF-8 bytes
//!
//! The trailer follows the payload so a matrix can be streamed gene by gene
//! without knowing the gene count in advance.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::info;

use lane_core::data::CountSource;

pub const MAGIC: [u8; 4] = *b"LNCM";
pub const VERSION: u32 = 1;
const HEADER_LEN: usize = 24;

/// Streaming LNCM writer. Rows are appended with [`write_gene`]; the trailer
/// and final gene count are written by [`finish`].
///
/// [`write_gene`]: CountMatrixWriter::write_gene
/// [`finish`]: CountMatrixWriter::finish
pub struct CountMatrixWriter<W: Write + Seek> {
    inner: W,
    cell_ids: Vec<String>,
    gene_ids: Vec<String>,
}

impl<W: Write + Seek> CountMatrixWriter<W> {
    pub fn new(mut inner: W, cell_ids: Vec<String>) -> Result<Self> {
        inner.write_all(&MAGIC)?;
        inner.write_all(&VERSION.to_le_bytes())?;
        inner.write_all(&0u64.to_le_bytes())?;
        inner.write_all(&(cell_ids.len() as u64).to_le_bytes())?;
        Ok(Self {
            inner,
            cell_ids,
            gene_ids: Vec::new(),
        })
    }

    pub fn write_gene(&mut self, gene_id: &str, counts: &[f64]) -> Result<()> {
        if counts.len() != self.cell_ids.len() {
            bail!(
                "Gene '{}' has {} counts, expected {}",
                gene_id,
                counts.len(),
                self.cell_ids.len()
            );
        }
        for &v in counts {
            self.inner.write_all(&v.to_le_bytes())?;
        }
        self.gene_ids.push(gene_id.to_string());
        Ok(())
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Write the id trailer, patch the gene count and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        for id in self.cell_ids.iter().chain(self.gene_ids.iter()) {
            let bytes = id.as_bytes();
            self.inner.write_all(&(bytes.len() as u32).to_le_bytes())?;
            self.inner.write_all(bytes)?;
        }
        self.inner.seek(SeekFrom::Start(8))?;
        self.inner.write_all(&(self.gene_ids.len() as u64).to_le_bytes())?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Write a whole in-memory matrix (`data` row-major) to `path`.
pub fn write_count_matrix(path: &Path, gene_ids: &[String], cell_ids: &[String], data: &[f64]) -> Result<()> {
    let n_cells = cell_ids.len();
    if data.len() != gene_ids.len() * n_cells {
        bail!(
            "Count data has {} entries, expected {} genes x {} cells",
            data.len(),
            gene_ids.len(),
            n_cells
        );
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = CountMatrixWriter::new(BufWriter::new(file), cell_ids.to_vec())?;
    for (g, id) in gene_ids.iter().enumerate() {
        writer.write_gene(id, &data[g * n_cells..(g + 1) * n_cells])?;
    }
    writer.finish()?;
    Ok(())
}

/// Read-only genes x cells matrix backed by a memory-mapped LNCM file.
pub struct MappedCountMatrix {
    mmap: Mmap,
    n_genes: usize,
    n_cells: usize,
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
}

impl MappedCountMatrix {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open count matrix: {}", path.display()))?;
        // The file is never written while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_LEN {
            bail!("Count matrix file too small: {} bytes", mmap.len());
        }
        if mmap[0..4] != MAGIC {
            bail!("Invalid count matrix magic bytes: {:?}", &mmap[0..4]);
        }
        let version = u32::from_le_bytes(le_array(&mmap[4..8]));
        if version != VERSION {
            bail!("Unsupported count matrix version {} (expected {})", version, VERSION);
        }
        let n_genes = u64::from_le_bytes(le_array(&mmap[8..16])) as usize;
        let n_cells = u64::from_le_bytes(le_array(&mmap[16..24])) as usize;

        let payload_end = n_genes
            .checked_mul(n_cells)
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Count matrix truncated: {} genes x {} cells do not fit in {} bytes",
                    n_genes,
                    n_cells,
                    mmap.len()
                )
            })?;

        let mut pos = payload_end;
        let cell_ids = read_ids(&mmap, &mut pos, n_cells).context("Reading cell ids")?;
        let gene_ids = read_ids(&mmap, &mut pos, n_genes).context("Reading gene ids")?;

        info!(
            "Mapped count matrix {}: {} genes x {} cells",
            path.display(),
            n_genes,
            n_cells
        );
        Ok(Self {
            mmap,
            n_genes,
            n_cells,
            gene_ids,
            cell_ids,
        })
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    #[inline]
    fn value(&self, gene: usize, cell: usize) -> f64 {
        let offset = HEADER_LEN + (gene * self.n_cells + cell) * 8;
        f64::from_le_bytes(le_array(&self.mmap[offset..offset + 8]))
    }
}

impl CountSource for MappedCountMatrix {
    fn n_genes(&self) -> usize {
        self.n_genes
    }

    fn n_cells(&self) -> usize {
        self.n_cells
    }

    fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    fn read_cells(&self, gene: usize, cells: &[usize], out: &mut Vec<f64>) -> Result<()> {
        if gene >= self.n_genes {
            bail!("Gene index {} out of range ({})", gene, self.n_genes);
        }
        out.clear();
        out.reserve(cells.len());
        for &c in cells {
            if c >= self.n_cells {
                bail!("Cell index {} out of range ({})", c, self.n_cells);
            }
            out.push(self.value(gene, c));
        }
        Ok(())
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn read_ids(data: &[u8], pos: &mut usize, count: usize) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        if *pos + 4 > data.len() {
            bail!("Id table truncated at entry {}", i);
        }
        let len = u32::from_le_bytes(le_array(&data[*pos..*pos + 4])) as usize;
        *pos += 4;
        if *pos + len > data.len() {
            bail!("Id table truncated at entry {}", i);
        }
        let id = std::str::from_utf8(&data[*pos..*pos + len]).with_context(|| format!("Id {} is not UTF-8", i))?;
        ids.push(id.to_string());
        *pos += len;
    }
    Ok(ids)
}

/// Parse one count field; NA is not a valid count.
fn parse_count(s: &str, line: usize, gene: &str) -> Result<f64> {
    let v: f64 = s
        .parse()
        .with_context(|| format!("Line {}: count '{}' for gene '{}' is not a number", line, s, gene))?;
    if !v.is_finite() || v < 0.0 {
        bail!("Line {}: count {} for gene '{}' is negative or non-finite", line, v, gene);
    }
    Ok(v)
}

/// Convert a counts TSV (header: id column then one column per cell; one
/// row per gene) into an LNCM file, streaming row by row. Returns the
/// number of genes and cells written.
pub fn convert_counts_tsv(tsv: &Path, out: &Path) -> Result<(usize, usize)> {
    let input = File::open(tsv).with_context(|| format!("Failed to read counts file: {}", tsv.display()))?;
    let output = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let (n_genes, n_cells) = stream_counts(BufReader::new(input), BufWriter::new(output))?;
    info!(
        "Converted {} -> {} ({} genes x {} cells)",
        tsv.display(),
        out.display(),
        n_genes,
        n_cells
    );
    Ok((n_genes, n_cells))
}

fn stream_counts<R: BufRead, W: Write + Seek>(reader: R, sink: W) -> Result<(usize, usize)> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty counts file"))??;
    let delim = if header.contains('\t') { '\t' } else { ' ' };
    let cell_ids: Vec<String> = header
        .split(delim)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .skip(1)
        .map(str::to_string)
        .collect();
    if cell_ids.is_empty() {
        bail!("Counts header has no cell columns");
    }
    let n_cells = cell_ids.len();

    let mut writer = CountMatrixWriter::new(sink, cell_ids)?;
    let mut row = Vec::with_capacity(n_cells);
    for (line_num, line) in lines.enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(delim).map(|s| s.trim()).filter(|s| !s.is_empty());
        let gene = fields.next().unwrap_or_default();
        row.clear();
        for f in fields {
            row.push(parse_count(f, line_num + 2, gene)?);
        }
        if row.len() != n_cells {
            bail!(
                "Line {}: gene '{}' has {} counts, expected {}",
                line_num + 2,
                gene,
                row.len(),
                n_cells
            );
        }
        writer.write_gene(gene, &row)?;
    }
    let n_genes = writer.n_genes();
    if n_genes == 0 {
        bail!("Counts file has no gene rows");
    }
    writer.finish()?;
    Ok((n_genes, n_cells))
}

/// An LNCM matrix converted into a temporary file; the file is removed
/// when this value is dropped.
pub struct TempCountMatrix {
    matrix: MappedCountMatrix,
    _file: NamedTempFile,
}

impl TempCountMatrix {
    pub fn matrix(&self) -> &MappedCountMatrix {
        &self.matrix
    }
}

/// Convert a counts TSV into a temporary LNCM file and map it.
pub fn counts_tsv_to_tempfile(tsv: &Path) -> Result<TempCountMatrix> {
    let file = NamedTempFile::new().context("Failed to create temporary count matrix")?;
    convert_counts_tsv(tsv, file.path())?;
    let matrix = MappedCountMatrix::open(file.path())?;
    Ok(TempCountMatrix { matrix, _file: file })
}
