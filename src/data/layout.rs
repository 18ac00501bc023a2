//! Observation layout for the regular sparse column representation.
//!
//! A layout bundles everything about a mixed model that stays fixed while the
//! variance-component parameters move:
//! - `rv` (`k x n`): random-effect coefficient indices touched by each observation
//! - `xv` (`kpp x n`): the matching random-effect and fixed-effect design values
//! - `lower`: diagonal/off-diagonal markers of the packed relative covariance factor
//!
//! Dimensions `p` and `q` are derived, and the factor's column structure is
//! scanned from `lower` once so accumulation never has to rediscover it.

use crate::error::{RscError, Result};
use crate::model::lambda::RelativeFactor;
use nalgebra::DMatrix;

/// Immutable per-model layout shared by every accumulation call.
#[derive(Debug, Clone)]
pub struct RscLayout {
    /// Random-effect coefficient indices (k × n).
    rv: DMatrix<usize>,
    /// Random and fixed design values (kpp × n).
    xv: DMatrix<f64>,
    /// Packed factor markers: 0 on diagonals, non-zero elsewhere.
    lower: Vec<f64>,
    /// Global coefficient index of every local slot (kpp × n).
    rows: DMatrix<usize>,
    /// Column structure of the relative covariance factor.
    factor: RelativeFactor,
    k: usize,
    kpp: usize,
    n: usize,
    p: usize,
    q: usize,
}

impl RscLayout {
    /// Build a layout, validating the shapes of `rv`, `xv` and `lower`.
    ///
    /// Fails with [`RscError::DimensionMismatch`] when `rv` and `xv` disagree on
    /// the number of observations, and with [`RscError::InvalidLayout`] for
    /// structural problems (no observations, `xv` shorter than `rv`, indices
    /// not starting at 0, unsorted index columns, malformed `lower`).
    pub fn new(rv: DMatrix<usize>, xv: DMatrix<f64>, lower: Vec<f64>) -> Result<Self> {
        let k = rv.nrows();
        let kpp = xv.nrows();
        let n = xv.ncols();

        if rv.ncols() != n {
            return Err(RscError::DimensionMismatch {
                what: "rv columns",
                expected: n,
                actual: rv.ncols(),
            });
        }
        if kpp < k {
            return Err(RscError::InvalidLayout(format!(
                "xv has {} rows but rv has {}; xv must stack the fixed effects below the random effects",
                kpp, k
            )));
        }
        if rv.is_empty() {
            return Err(RscError::InvalidLayout(
                "rv must have at least one row and one observation".to_string(),
            ));
        }

        let min_index = rv.iter().copied().min().unwrap_or(0);
        if min_index != 0 {
            return Err(RscError::InvalidLayout(format!(
                "minimum row index must be 0, found {}",
                min_index
            )));
        }
        let q = rv
            .iter()
            .copied()
            .max()
            .and_then(|max_index| max_index.checked_add(1))
            .ok_or_else(|| {
                RscError::InvalidLayout("maximum row index leaves no room for q".to_string())
            })?;
        let p = kpp - k;

        // The column scan during accumulation walks each observation's indices
        // from the bottom up, so they must be strictly increasing.
        for j in 0..n {
            let column = rv.column(j);
            for (a, b) in column.iter().zip(column.iter().skip(1)) {
                if a >= b {
                    return Err(RscError::InvalidLayout(format!(
                        "rv column {} is not strictly increasing ({} followed by {})",
                        j, a, b
                    )));
                }
            }
        }

        let factor = RelativeFactor::from_lower(&lower, k)?;

        let rows = DMatrix::from_fn(kpp, n, |i, j| if i < k { rv[(i, j)] } else { q + (i - k) });

        let layout = Self {
            rv,
            xv,
            lower,
            rows,
            factor,
            k,
            kpp,
            n,
            p,
            q,
        };
        log::debug!("{}", layout);
        Ok(layout)
    }

    /// Number of random-effect slots per observation.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of random plus fixed slots per observation.
    #[inline]
    pub fn kpp(&self) -> usize {
        self.kpp
    }

    /// Number of observations.
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of fixed-effect coefficients.
    #[inline]
    pub fn p(&self) -> usize {
        self.p
    }

    /// Number of random-effect coefficients.
    #[inline]
    pub fn q(&self) -> usize {
        self.q
    }

    /// Order of the penalized cross-product matrix (`q + p`).
    #[inline]
    pub fn order(&self) -> usize {
        self.q + self.p
    }

    /// Random-effect index matrix.
    pub fn rv(&self) -> &DMatrix<usize> {
        &self.rv
    }

    /// Design value matrix.
    pub fn xv(&self) -> &DMatrix<f64> {
        &self.xv
    }

    /// Packed factor markers.
    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    /// Column structure of the relative covariance factor.
    pub fn factor(&self) -> &RelativeFactor {
        &self.factor
    }

    /// Design values of observation `j` (length `kpp`).
    #[inline]
    pub fn observation(&self, j: usize) -> &[f64] {
        &self.xv.as_slice()[j * self.kpp..(j + 1) * self.kpp]
    }

    /// Global coefficient indices touched by observation `j` (length `kpp`).
    ///
    /// The first `k` entries come from `rv`; fixed effects follow at `q..q + p`.
    #[inline]
    pub fn coefficient_rows(&self, j: usize) -> &[usize] {
        &self.rows.as_slice()[j * self.kpp..(j + 1) * self.kpp]
    }
}

impl std::fmt::Display for RscLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "k = {}, kpp = {}, n = {}, p = {}, q = {}",
            self.k, self.kpp, self.n, self.p, self.q
        )
    }
}
