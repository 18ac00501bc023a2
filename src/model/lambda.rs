//! Relative covariance factor application.
//!
//! The factor `Λ` is block diagonal with lower-triangular blocks. Its free
//! entries are packed column by column into `theta`, and the parallel `lower`
//! vector marks each packed position as a diagonal (`0.0`) or an off-diagonal
//! (any other value, typically `-inf` as a lower bound).
//!
//! Applying the factor to an observation's design values computes `Λᵀ x` on
//! the random-effect rows, in place:
//!
//! ```text
//! x[d] <- theta[t] * x[d] + theta[t + 1] * x[d + 1] + ... + theta[t + m - 1] * x[d + m - 1]
//! ```
//!
//! for every factor column with diagonal at packed position `t`, output row
//! `d` and `m` stored entries. Columns are processed in increasing `d`, so the
//! rows read below `d` are still untransformed.

use crate::data::RscLayout;
use crate::error::{RscError, Result};
use nalgebra::DMatrix;

/// One column of the packed lower-triangular factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactorColumn {
    /// Position of the diagonal entry in `theta`.
    pub theta_pos: usize,
    /// Random-effect row the column writes to.
    pub row: usize,
    /// Number of stored entries (diagonal plus off-diagonals).
    pub len: usize,
}

/// Column structure of the relative covariance factor, scanned from `lower`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativeFactor {
    columns: Vec<FactorColumn>,
    n_theta: usize,
}

impl RelativeFactor {
    /// Scan `lower` into factor columns.
    ///
    /// `k` is the number of random-effect rows per observation; `lower` must
    /// mark exactly `k` diagonals, start with one, and never extend a column
    /// past row `k`.
    pub fn from_lower(lower: &[f64], k: usize) -> Result<Self> {
        let mut columns: Vec<FactorColumn> = Vec::with_capacity(k);

        for (pos, &marker) in lower.iter().enumerate() {
            if marker == 0.0 {
                columns.push(FactorColumn {
                    theta_pos: pos,
                    row: columns.len(),
                    len: 1,
                });
            } else {
                match columns.last_mut() {
                    Some(column) => column.len += 1,
                    None => {
                        return Err(RscError::InvalidLayout(
                            "lower must begin with a diagonal (zero) marker".to_string(),
                        ))
                    }
                }
            }
        }

        if columns.len() != k {
            return Err(RscError::InvalidLayout(format!(
                "lower marks {} diagonal entries but rv has {} rows",
                columns.len(),
                k
            )));
        }
        if let Some(column) = columns.iter().find(|c| c.row + c.len > k) {
            return Err(RscError::InvalidLayout(format!(
                "factor column at row {} has {} entries and runs past the {} random-effect rows",
                column.row, column.len, k
            )));
        }

        Ok(Self {
            columns,
            n_theta: lower.len(),
        })
    }

    /// Factor columns in application order.
    pub fn columns(&self) -> &[FactorColumn] {
        &self.columns
    }

    /// Number of packed factor entries (the required length of `theta`).
    pub fn n_theta(&self) -> usize {
        self.n_theta
    }

    /// Dimension of `Λ`.
    pub fn k(&self) -> usize {
        self.columns.len()
    }

    /// Parameter vector for which `Λ` is the identity.
    pub fn identity_theta(&self) -> Vec<f64> {
        let mut theta = vec![0.0; self.n_theta];
        for column in &self.columns {
            theta[column.theta_pos] = 1.0;
        }
        theta
    }

    /// Overwrite the random-effect rows of `block` with `Λᵀ block`.
    ///
    /// Rows at and beyond `k` are left as they are. `theta` must have
    /// [`n_theta`](Self::n_theta) entries and `block` at least `k`; this is not
    /// rechecked here.
    #[inline]
    pub fn apply<'a>(&self, theta: &[f64], block: &'a mut [f64]) -> &'a mut [f64] {
        for column in &self.columns {
            let coefs = &theta[column.theta_pos..column.theta_pos + column.len];
            let values = &block[column.row..column.row + column.len];
            let mixed: f64 = coefs.iter().zip(values).map(|(t, x)| t * x).sum();
            block[column.row] = mixed;
        }
        block
    }

    /// Materialize `Λ` as a dense `k x k` matrix.
    pub fn to_dense(&self, theta: &[f64]) -> Result<DMatrix<f64>> {
        if theta.len() != self.n_theta {
            return Err(RscError::DimensionMismatch {
                what: "theta",
                expected: self.n_theta,
                actual: theta.len(),
            });
        }
        let k = self.k();
        let mut lambda = DMatrix::zeros(k, k);
        for column in &self.columns {
            for offset in 0..column.len {
                lambda[(column.row + offset, column.row)] = theta[column.theta_pos + offset];
            }
        }
        Ok(lambda)
    }
}

/// Apply the layout's relative covariance factor to one observation block.
///
/// `block` holds the `kpp` stacked random and fixed design values of one
/// observation and is transformed in place; the same buffer is returned.
pub fn apply_lambda<'a>(
    layout: &RscLayout,
    theta: &[f64],
    block: &'a mut [f64],
) -> Result<&'a mut [f64]> {
    if theta.len() != layout.lower().len() {
        return Err(RscError::DimensionMismatch {
            what: "theta",
            expected: layout.lower().len(),
            actual: theta.len(),
        });
    }
    if block.len() != layout.kpp() {
        return Err(RscError::DimensionMismatch {
            what: "block",
            expected: layout.kpp(),
            actual: block.len(),
        });
    }
    Ok(layout.factor().apply(theta, block))
}

/// Dense `Λ` for the layout's factor structure.
pub fn lambda_dense(layout: &RscLayout, theta: &[f64]) -> Result<DMatrix<f64>> {
    layout.factor().to_dense(theta)
}
