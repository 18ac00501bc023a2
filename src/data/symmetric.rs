//! Upper-triangle compressed sparse column storage for symmetric matrices.
//!
//! The sparsity pattern (`colptr`, `rowval`) is fixed once and shared by every
//! accumulation; only the value array is rewritten. Within each column the
//! stored rows are strictly increasing and never exceed the column index, so
//! a column that holds its diagonal holds it as its last entry.

use crate::data::RscLayout;
use crate::error::{RscError, Result};
use nalgebra::DMatrix;
use sprs::CsMat;
use std::collections::BTreeSet;
use std::ops::Range;

/// Fixed upper-triangle CSC pattern of a square matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperPattern {
    order: usize,
    colptr: Vec<usize>,
    rowval: Vec<usize>,
}

impl UpperPattern {
    /// Create a pattern from raw CSC arrays.
    ///
    /// Fails with [`RscError::TypeMismatch`] if any column stores rows out of
    /// order, duplicates a row, or stores an entry below the diagonal.
    pub fn new(order: usize, colptr: Vec<usize>, rowval: Vec<usize>) -> Result<Self> {
        if colptr.len() != order + 1 {
            return Err(RscError::DimensionMismatch {
                what: "colptr",
                expected: order + 1,
                actual: colptr.len(),
            });
        }
        if colptr[0] != 0 || colptr[order] != rowval.len() {
            return Err(RscError::TypeMismatch(format!(
                "column pointers must run from 0 to {}, got {} to {}",
                rowval.len(),
                colptr[0],
                colptr[order]
            )));
        }

        if let Some(col) = colptr.windows(2).position(|pair| pair[0] > pair[1]) {
            return Err(RscError::TypeMismatch(format!(
                "column pointers decrease at column {}",
                col
            )));
        }

        for col in 0..order {
            let rows = &rowval[colptr[col]..colptr[col + 1]];
            if rows.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(RscError::TypeMismatch(format!(
                    "rows of column {} are not strictly increasing",
                    col
                )));
            }
            if let Some(&row) = rows.last() {
                if row > col {
                    return Err(RscError::TypeMismatch(format!(
                        "entry ({}, {}) lies below the diagonal; A must store only its upper triangle",
                        row, col
                    )));
                }
            }
        }

        Ok(Self {
            order,
            colptr,
            rowval,
        })
    }

    /// Minimal pattern able to receive every accumulation over `layout`.
    ///
    /// Stores every diagonal of the `q + p` columns plus, for each
    /// observation, every pair of coefficients it touches.
    pub fn from_layout(layout: &RscLayout) -> Self {
        let order = layout.order();
        let mut columns: Vec<BTreeSet<usize>> =
            (0..order).map(|col| BTreeSet::from([col])).collect();

        for j in 0..layout.n() {
            let rows = layout.coefficient_rows(j);
            for (i, &col) in rows.iter().enumerate() {
                columns[col].extend(rows[..i].iter().copied());
            }
        }

        let mut colptr = Vec::with_capacity(order + 1);
        let mut rowval = Vec::new();
        colptr.push(0);
        for column in &columns {
            rowval.extend(column.iter().copied());
            colptr.push(rowval.len());
        }

        log::debug!(
            "built upper pattern of order {} with {} stored entries",
            order,
            rowval.len()
        );

        Self {
            order,
            colptr,
            rowval,
        }
    }

    /// Matrix order.
    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.rowval.len()
    }

    /// Column pointers (length `order + 1`).
    #[inline]
    pub fn colptr(&self) -> &[usize] {
        &self.colptr
    }

    /// Row indices of the stored entries.
    #[inline]
    pub fn rowval(&self) -> &[usize] {
        &self.rowval
    }

    /// Storage range of column `col`.
    #[inline]
    pub fn column_range(&self, col: usize) -> Range<usize> {
        self.colptr[col]..self.colptr[col + 1]
    }

    /// Last stored row of column `col`, if the column is non-empty.
    #[inline]
    pub fn last_row(&self, col: usize) -> Option<usize> {
        self.rowval[self.column_range(col)].last().copied()
    }

    /// Storage index of the diagonal of column `col`.
    #[inline]
    pub fn diagonal_index(&self, col: usize) -> Option<usize> {
        let range = self.column_range(col);
        match range.end.checked_sub(1) {
            Some(last) if last >= range.start && self.rowval[last] == col => Some(last),
            _ => None,
        }
    }

    /// Storage index of entry (`row`, `col`) with `row <= col`.
    pub fn find(&self, row: usize, col: usize) -> Option<usize> {
        let range = self.column_range(col);
        self.rowval[range.clone()]
            .binary_search(&row)
            .ok()
            .map(|offset| range.start + offset)
    }
}

/// Symmetric matrix stored as its upper triangle in CSC form.
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricCsc {
    pattern: UpperPattern,
    nzval: Vec<f64>,
}

impl SymmetricCsc {
    /// A matrix with the given pattern and all stored values zero.
    pub fn zeros(pattern: UpperPattern) -> Self {
        let nzval = vec![0.0; pattern.nnz()];
        Self { pattern, nzval }
    }

    /// Create from a pattern and matching values.
    pub fn new(pattern: UpperPattern, nzval: Vec<f64>) -> Result<Self> {
        if nzval.len() != pattern.nnz() {
            return Err(RscError::DimensionMismatch {
                what: "nzval",
                expected: pattern.nnz(),
                actual: nzval.len(),
            });
        }
        Ok(Self { pattern, nzval })
    }

    /// Read an upper-triangle-stored symmetric matrix from `sprs`.
    ///
    /// The matrix must be square, in CSC storage, and hold no entries below
    /// the diagonal; anything else is a [`RscError::TypeMismatch`].
    pub fn from_csc(mat: &CsMat<f64>) -> Result<Self> {
        if !mat.is_csc() {
            return Err(RscError::TypeMismatch(
                "A must be stored in compressed sparse column form".to_string(),
            ));
        }
        let (nrows, ncols) = mat.shape();
        if nrows != ncols {
            return Err(RscError::TypeMismatch(format!(
                "A must be square, got {} x {}",
                nrows, ncols
            )));
        }

        let mut colptr = Vec::with_capacity(ncols + 1);
        let mut rowval = Vec::with_capacity(mat.nnz());
        let mut nzval = Vec::with_capacity(mat.nnz());
        colptr.push(0);
        for col_vec in mat.outer_iterator() {
            for (row, &val) in col_vec.iter() {
                rowval.push(row);
                nzval.push(val);
            }
            colptr.push(rowval.len());
        }

        let pattern = UpperPattern::new(ncols, colptr, rowval)?;
        Self::new(pattern, nzval)
    }

    /// Copy into an `sprs` CSC matrix holding the upper triangle.
    pub fn to_csc(&self) -> CsMat<f64> {
        let order = self.order();
        CsMat::new_csc(
            (order, order),
            self.pattern.colptr.clone(),
            self.pattern.rowval.clone(),
            self.nzval.clone(),
        )
    }

    /// Expand into a full dense symmetric matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let order = self.order();
        let mut dense = DMatrix::zeros(order, order);
        for col in 0..order {
            for idx in self.pattern.column_range(col) {
                let row = self.pattern.rowval[idx];
                dense[(row, col)] = self.nzval[idx];
                dense[(col, row)] = self.nzval[idx];
            }
        }
        dense
    }

    /// Value at (`row`, `col`), reading either triangle; 0 if not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (row, col) = if row <= col { (row, col) } else { (col, row) };
        self.pattern
            .find(row, col)
            .map(|idx| self.nzval[idx])
            .unwrap_or(0.0)
    }

    /// Matrix order.
    #[inline]
    pub fn order(&self) -> usize {
        self.pattern.order
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.nzval.len()
    }

    /// The fixed sparsity pattern.
    #[inline]
    pub fn pattern(&self) -> &UpperPattern {
        &self.pattern
    }

    /// Stored values, in pattern order.
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.nzval
    }

    /// Pattern and mutable values at once.
    #[inline]
    pub(crate) fn parts_mut(&mut self) -> (&UpperPattern, &mut [f64]) {
        (&self.pattern, &mut self.nzval)
    }
}
