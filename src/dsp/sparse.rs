//! Sparse matrices for the injection spectrogram.
//!
//! Injections are assembled in coordinate (COO) form, converted to compressed
//! sparse row (CSR) form, and broadcast to the worker team in CSR form so the
//! builder can add one row per raw DFT with a single slice lookup.

use crate::comm::{Rank, SharedBuffer};
use anyhow::Result;

/// Coordinate-form triplet matrix. Duplicate entries are summed when
/// converting to CSR, matching the usual COO semantics.
pub struct CooMatrix {
    shape: (usize, usize),
    rows: Vec<i64>,
    cols: Vec<i32>,
    values: Vec<f32>,
}

impl CooMatrix {
    pub fn with_capacity(shape: (usize, usize), capacity: usize) -> Self {
        CooMatrix {
            shape,
            rows: Vec::with_capacity(capacity),
            cols: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Append one entry. Out-of-range rows are the caller's responsibility
    /// to filter; debug builds assert.
    pub fn push(&mut self, row: usize, col: usize, value: f32) {
        debug_assert!(row < self.shape.0 && col < self.shape.1);
        self.rows.push(row as i64);
        self.cols.push(col as i32);
        self.values.push(value);
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Convert to CSR, summing duplicates.
    pub fn to_csr(&self) -> CsrMatrix {
        let (nrows, _) = self.shape;

        // Counting sort by row keeps the conversion linear; column order
        // within a row follows insertion order, which the builder does not
        // depend on.
        let mut counts = vec![0usize; nrows + 1];
        for &r in &self.rows {
            counts[r as usize + 1] += 1;
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }
        let indptr: Vec<i64> = counts.iter().map(|&c| c as i64).collect();

        let mut cursor = counts[..nrows].to_vec();
        let mut indices = vec![0i32; self.nnz()];
        let mut values = vec![0.0f32; self.nnz()];
        for ((&r, &c), &v) in self.rows.iter().zip(&self.cols).zip(&self.values) {
            let at = cursor[r as usize];
            indices[at] = c;
            values[at] = v;
            cursor[r as usize] += 1;
        }

        CsrMatrix {
            shape: self.shape,
            indptr: SharedBuffer::Owned(indptr),
            indices: SharedBuffer::Owned(indices),
            values: SharedBuffer::Owned(values),
        }
    }
}

/// Compressed sparse row matrix. The three backing arrays may live in memory
/// or in a per-rank memory-mapped temporary after a broadcast.
pub struct CsrMatrix {
    shape: (usize, usize),
    indptr: SharedBuffer<i64>,
    indices: SharedBuffer<i32>,
    values: SharedBuffer<f32>,
}

impl CsrMatrix {
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and values of row `r`.
    pub fn row(&self, r: usize) -> (&[i32], &[f32]) {
        let begin = self.indptr[r] as usize;
        let end = self.indptr[r + 1] as usize;
        (&self.indices[begin..end], &self.values[begin..end])
    }

    /// Add row `r` into a dense accumulator.
    pub fn add_row_into(&self, r: usize, dense: &mut [f32]) {
        let (cols, vals) = self.row(r);
        for (&c, &v) in cols.iter().zip(vals.iter()) {
            dense[c as usize] += v;
        }
    }

    /// Sum of every stored entry.
    pub fn total(&self) -> f64 {
        self.values.iter().map(|&v| v as f64).sum()
    }

    /// Broadcast a CSR matrix from `root` to the whole team. Metadata goes
    /// in-memory; each of the three arrays goes through the size-tiered
    /// broadcast, so multi-gigabyte injection sets never hold W in-memory
    /// copies at once.
    pub fn broadcast(rank: &Rank, root: usize, matrix: Option<CsrMatrix>) -> Result<CsrMatrix> {
        let shape: (usize, usize) = rank.broadcast(root, matrix.as_ref().map(|m| m.shape));
        let (indptr, indices, values) = match matrix {
            Some(m) => (
                Some(m.indptr.into_vec()),
                Some(m.indices.into_vec()),
                Some(m.values.into_vec()),
            ),
            None => (None, None, None),
        };
        let indptr = rank.broadcast_large(root, indptr)?;
        let indices = rank.broadcast_large(root, indices)?;
        let values = rank.broadcast_large(root, values)?;
        Ok(CsrMatrix {
            shape,
            indptr,
            indices,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coo_to_csr_round_trip() {
        let mut coo = CooMatrix::with_capacity((4, 5), 4);
        coo.push(2, 1, 1.5);
        coo.push(0, 4, 2.0);
        coo.push(2, 3, -0.5);
        coo.push(3, 0, 7.0);
        let csr = coo.to_csr();

        assert_eq!(csr.nnz(), 4);
        assert_eq!(csr.row(1), (&[][..], &[][..]));
        let (cols, vals) = csr.row(2);
        assert_eq!(cols, &[1, 3]);
        assert_eq!(vals, &[1.5, -0.5]);

        let mut dense = vec![0.0f32; 5];
        csr.add_row_into(0, &mut dense);
        assert_eq!(dense[4], 2.0);
    }

    #[test]
    fn csr_total_sums_all_entries() {
        let mut coo = CooMatrix::with_capacity((2, 2), 2);
        coo.push(0, 0, 1.0);
        coo.push(1, 1, 3.0);
        assert!((coo.to_csr().total() - 4.0).abs() < 1e-12);
    }
}
