//! Accumulation of the penalized cross-product matrix and right-hand side.
//!
//! For parameters `theta` and residual weights `resid`, computes
//!
//! ```text
//! A     = [I 0; 0 0] + Σ_j w_j w_jᵀ      (upper triangle, fixed pattern)
//! ubeta =              Σ_j resid_j w_j
//! ```
//!
//! where `w_j` is observation `j`'s design column after applying `Λᵀ` and the
//! sums scatter through the observation's coefficient indices. Each call
//! overwrites `A`'s values and `ubeta` completely.
//!
//! # Example
//! ```
//! use regular_sparse::prelude::*;
//! use nalgebra::DMatrix;
//!
//! // (1 | g) with two groups and an intercept
//! let rv = DMatrix::from_row_slice(1, 3, &[0, 1, 1]);
//! let xv = DMatrix::from_element(2, 3, 1.0);
//! let layout = RscLayout::new(rv, xv, vec![0.0]).unwrap();
//!
//! let mut a = SymmetricCsc::zeros(UpperPattern::from_layout(&layout));
//! let mut ubeta = vec![0.0; layout.order()];
//! update_a(&layout, &[1.0], &[1.0, 1.0, 1.0], &mut a, &mut ubeta).unwrap();
//!
//! assert_eq!(a.get(1, 1), 3.0);
//! assert_eq!(ubeta, vec![1.0, 2.0, 3.0]);
//! ```

use crate::data::{RscLayout, SymmetricCsc, UpperPattern};
use crate::error::{PatternViolation, RscError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::path::Path;

/// Configuration for accumulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulateConfig {
    /// Accumulate observation chunks on the rayon pool.
    pub parallel: bool,
    /// Observations per parallel chunk.
    pub chunk_size: usize,
    /// Run on a dedicated pool of this many threads instead of the global one.
    pub num_threads: Option<usize>,
}

impl Default for AccumulateConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            chunk_size: 4096,
            num_threads: None,
        }
    }
}

impl AccumulateConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(RscError::from)
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RscError::InvalidParameter(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(RscError::InvalidParameter(
                "num_threads must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Accumulate `A` and `ubeta` for the given parameters, one observation at a time.
///
/// # Arguments
/// * `layout` - Observation layout (`rv`, `xv`, `lower`)
/// * `theta` - Factor parameters, one per entry of `lower`
/// * `resid` - Per-observation weights for the right-hand side (length `n`)
/// * `a` - Upper-triangle symmetric matrix of order `q + p`; values are overwritten
/// * `ubeta` - Combined right-hand side (length `q + p`); overwritten
///
/// # Errors
/// Dimension mismatches are reported before anything is written. A pattern
/// that cannot receive an observation's contribution aborts the scan; `a` and
/// `ubeta` are then partially accumulated and must not be used.
pub fn update_a(
    layout: &RscLayout,
    theta: &[f64],
    resid: &[f64],
    a: &mut SymmetricCsc,
    ubeta: &mut [f64],
) -> Result<()> {
    check_inputs(layout, theta, resid, a, ubeta)?;
    log::trace!(
        "accumulating {} observations into {} stored entries",
        layout.n(),
        a.nnz()
    );

    let (pattern, nzval) = a.parts_mut();
    nzval.fill(0.0);
    ubeta.fill(0.0);
    add_identity(pattern, nzval, layout.q());

    let mut w = vec![0.0; layout.kpp()];
    for (j, &rj) in resid.iter().enumerate() {
        scatter_observation(layout, pattern, theta, j, rj, &mut w, nzval, ubeta)?;
    }

    Ok(())
}

/// Parallel [`update_a`]: observations are split into chunks of `chunk_size`,
/// each chunk accumulates into private buffers, and the buffers are summed.
///
/// Agrees with the serial result up to floating-point summation order.
pub fn update_a_par(
    layout: &RscLayout,
    theta: &[f64],
    resid: &[f64],
    a: &mut SymmetricCsc,
    ubeta: &mut [f64],
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(RscError::InvalidParameter(
            "chunk_size must be at least 1".to_string(),
        ));
    }
    check_inputs(layout, theta, resid, a, ubeta)?;

    let (pattern, nzval) = a.parts_mut();
    nzval.fill(0.0);
    ubeta.fill(0.0);

    let n = layout.n();
    let nnz = pattern.nnz();
    let order = layout.order();
    let starts: Vec<usize> = (0..n).step_by(chunk_size).collect();
    log::trace!(
        "accumulating {} observations in {} chunks into {} stored entries",
        n,
        starts.len(),
        nnz
    );

    let total = starts
        .into_par_iter()
        .map(|start| -> Result<Partial> {
            let end = (start + chunk_size).min(n);
            let mut partial = Partial::zeros(nnz, order);
            let mut w = vec![0.0; layout.kpp()];
            for j in start..end {
                scatter_observation(
                    layout,
                    pattern,
                    theta,
                    j,
                    resid[j],
                    &mut w,
                    &mut partial.nzval,
                    &mut partial.ubeta,
                )?;
            }
            Ok(partial)
        })
        .try_reduce(|| Partial::zeros(nnz, order), |a, b| Ok(a.merge(b)))?;

    nzval.copy_from_slice(&total.nzval);
    ubeta.copy_from_slice(&total.ubeta);
    add_identity(pattern, nzval, layout.q());

    Ok(())
}

/// Run [`update_a`] or [`update_a_par`] as selected by `config`.
pub fn update_a_with(
    config: &AccumulateConfig,
    layout: &RscLayout,
    theta: &[f64],
    resid: &[f64],
    a: &mut SymmetricCsc,
    ubeta: &mut [f64],
) -> Result<()> {
    config.validate()?;
    if !config.parallel {
        return update_a(layout, theta, resid, a, ubeta);
    }

    match config.num_threads {
        Some(num_threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()?;
            pool.install(|| update_a_par(layout, theta, resid, a, ubeta, config.chunk_size))
        }
        None => update_a_par(layout, theta, resid, a, ubeta, config.chunk_size),
    }
}

/// [`update_a`] on an `sprs` matrix, rewriting its stored values in place.
///
/// The pattern is re-read and re-validated on every call; keep a
/// [`SymmetricCsc`] around when accumulating repeatedly.
pub fn update_a_csc(
    layout: &RscLayout,
    theta: &[f64],
    resid: &[f64],
    a: &mut CsMat<f64>,
    ubeta: &mut [f64],
) -> Result<()> {
    let mut sym = SymmetricCsc::from_csc(a)?;
    update_a(layout, theta, resid, &mut sym, ubeta)?;

    let data = a.data_mut();
    if data.len() != sym.nnz() {
        return Err(RscError::TypeMismatch(format!(
            "A stores {} values but its columns hold {} entries",
            data.len(),
            sym.nnz()
        )));
    }
    data.copy_from_slice(sym.values());
    Ok(())
}

fn check_inputs(
    layout: &RscLayout,
    theta: &[f64],
    resid: &[f64],
    a: &SymmetricCsc,
    ubeta: &[f64],
) -> Result<()> {
    if theta.len() != layout.lower().len() {
        return Err(RscError::DimensionMismatch {
            what: "theta",
            expected: layout.lower().len(),
            actual: theta.len(),
        });
    }
    if resid.len() != layout.n() {
        return Err(RscError::DimensionMismatch {
            what: "resid",
            expected: layout.n(),
            actual: resid.len(),
        });
    }
    if ubeta.len() != layout.order() {
        return Err(RscError::DimensionMismatch {
            what: "ubeta",
            expected: layout.order(),
            actual: ubeta.len(),
        });
    }
    if a.order() != layout.order() {
        return Err(RscError::DimensionMismatch {
            what: "A",
            expected: layout.order(),
            actual: a.order(),
        });
    }

    let pattern = a.pattern();
    for col in 0..layout.q() {
        if pattern.diagonal_index(col).is_none() {
            return Err(PatternViolation::IdentitySeed {
                column: col,
                last_row: pattern.last_row(col),
            }
            .into());
        }
    }
    Ok(())
}

/// Add 1 to the diagonal of every random-effect column.
///
/// Callers have already checked that those diagonals are stored.
fn add_identity(pattern: &UpperPattern, nzval: &mut [f64], q: usize) {
    for col in 0..q {
        if let Some(idx) = pattern.diagonal_index(col) {
            nzval[idx] += 1.0;
        }
    }
}

/// Transform observation `j` and scatter its contribution.
#[allow(clippy::too_many_arguments)]
fn scatter_observation(
    layout: &RscLayout,
    pattern: &UpperPattern,
    theta: &[f64],
    j: usize,
    rj: f64,
    w: &mut [f64],
    nzval: &mut [f64],
    ubeta: &mut [f64],
) -> Result<()> {
    w.copy_from_slice(layout.observation(j));
    layout.factor().apply(theta, w);

    let rows = layout.coefficient_rows(j);
    for (&row, &wi) in rows.iter().zip(w.iter()) {
        ubeta[row] += rj * wi;
    }

    let rowval = pattern.rowval();
    // Walk the observation's rows from the bottom so that column `rows[i]`
    // only receives rows `rows[..i]`, all of which lie above its diagonal.
    for i in (0..rows.len()).rev() {
        let col = rows[i];
        let start = pattern.column_range(col).start;
        let mut cursor = pattern
            .diagonal_index(col)
            .ok_or_else(|| PatternViolation::MissingDiagonal {
                column: col,
                last_row: pattern.last_row(col),
            })?;
        nzval[cursor] += w[i] * w[i];

        for l in (0..i).rev() {
            let target = rows[l];
            while cursor > start && rowval[cursor] > target {
                cursor -= 1;
            }
            if rowval[cursor] != target {
                return Err(PatternViolation::PatternMismatch {
                    column: col,
                    row: target,
                    observation: j,
                }
                .into());
            }
            nzval[cursor] += w[i] * w[l];
        }
    }

    Ok(())
}

/// Private accumulation buffers of one parallel chunk.
struct Partial {
    nzval: Vec<f64>,
    ubeta: Vec<f64>,
}

impl Partial {
    fn zeros(nnz: usize, order: usize) -> Self {
        Self {
            nzval: vec![0.0; nnz],
            ubeta: vec![0.0; order],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.nzval.iter_mut().zip(&other.nzval) {
            *a += b;
        }
        for (a, b) in self.ubeta.iter_mut().zip(&other.ubeta) {
            *a += b;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Intercept + slope for one group, one fixed effect, three observations.
    fn intercept_slope_layout() -> RscLayout {
        let rv = DMatrix::from_column_slice(2, 3, &[0, 1, 0, 1, 0, 1]);
        let xv = DMatrix::from_column_slice(3, 3, &[1.0, 1.0, 2.0, 1.0, 2.0, 0.0, 1.0, 3.0, 1.0]);
        RscLayout::new(rv, xv, vec![0.0, f64::NEG_INFINITY, 0.0]).unwrap()
    }

    /// Random intercept over two groups plus a fixed slope.
    fn two_group_layout() -> RscLayout {
        let rv = DMatrix::from_row_slice(1, 3, &[0, 1, 1]);
        let xv = DMatrix::from_column_slice(2, 3, &[1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        RscLayout::new(rv, xv, vec![0.0]).unwrap()
    }

    fn blank(layout: &RscLayout) -> (SymmetricCsc, Vec<f64>) {
        (
            SymmetricCsc::zeros(UpperPattern::from_layout(layout)),
            vec![0.0; layout.order()],
        )
    }

    #[test]
    fn test_config_default() {
        let config = AccumulateConfig::default();
        assert!(!config.parallel);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.num_threads, None);
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let config = AccumulateConfig {
            parallel: true,
            chunk_size: 128,
            num_threads: Some(2),
        };
        let yaml = config.to_yaml().unwrap();
        assert_eq!(AccumulateConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_config_partial_yaml_uses_defaults() {
        let config = AccumulateConfig::from_yaml("parallel: true\n").unwrap();
        assert!(config.parallel);
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "parallel: true").unwrap();
        writeln!(file, "chunk_size: 2").unwrap();
        file.flush().unwrap();

        let config = AccumulateConfig::from_yaml_file(file.path()).unwrap();
        assert!(config.parallel);
        assert_eq!(config.chunk_size, 2);
    }

    #[test]
    fn test_config_rejects_zero_chunk() {
        let err = AccumulateConfig::from_yaml("chunk_size: 0\n").unwrap_err();
        assert!(matches!(err, RscError::InvalidParameter(_)));
    }

    #[test]
    fn test_config_rejects_zero_threads() {
        let config = AccumulateConfig {
            num_threads: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_intercept_slope_by_hand() {
        let layout = intercept_slope_layout();
        let (mut a, mut ubeta) = blank(&layout);

        update_a(&layout, &[1.0, 0.0, 1.0], &[1.0, 2.0, 3.0], &mut a, &mut ubeta).unwrap();

        // I_2 (random block) + Σ x xᵀ over x = [1,1,2], [1,2,0], [1,3,1]
        assert_eq!(a.values(), &[4.0, 6.0, 15.0, 3.0, 5.0, 5.0]);
        assert_eq!(ubeta, vec![6.0, 14.0, 5.0]);
    }

    #[test]
    fn test_two_groups_by_hand() {
        let layout = two_group_layout();
        let (mut a, mut ubeta) = blank(&layout);

        update_a(&layout, &[2.0], &[1.0, 1.0, 1.0], &mut a, &mut ubeta).unwrap();

        // w = [2, 1], [2, 2], [2, 3] for groups 0, 1, 1
        assert_eq!(a.pattern().colptr(), &[0, 1, 2, 5]);
        assert_eq!(a.values(), &[5.0, 9.0, 2.0, 10.0, 14.0]);
        assert_eq!(ubeta, vec![2.0, 4.0, 6.0]);
        // groups never share an observation
        assert_eq!(a.get(0, 1), 0.0);
    }

    #[test]
    fn test_overwrites_previous_values() {
        let layout = two_group_layout();
        let pattern = UpperPattern::from_layout(&layout);
        let mut a = SymmetricCsc::new(pattern.clone(), vec![99.0; pattern.nnz()]).unwrap();
        let mut ubeta = vec![-7.0; layout.order()];

        update_a(&layout, &[2.0], &[1.0, 1.0, 1.0], &mut a, &mut ubeta).unwrap();

        let (mut fresh, mut fresh_ubeta) = blank(&layout);
        update_a(&layout, &[2.0], &[1.0, 1.0, 1.0], &mut fresh, &mut fresh_ubeta).unwrap();
        assert_eq!(a, fresh);
        assert_eq!(ubeta, fresh_ubeta);
    }

    #[test]
    fn test_dimension_checks() {
        let layout = intercept_slope_layout();
        let (mut a, mut ubeta) = blank(&layout);
        let theta = [1.0, 0.0, 1.0];
        let resid = [1.0, 1.0, 1.0];

        let err = update_a(&layout, &[1.0, 1.0], &resid, &mut a, &mut ubeta).unwrap_err();
        assert!(matches!(err, RscError::DimensionMismatch { what: "theta", expected: 3, actual: 2 }));

        let err = update_a(&layout, &theta, &[1.0], &mut a, &mut ubeta).unwrap_err();
        assert!(matches!(err, RscError::DimensionMismatch { what: "resid", .. }));

        let mut short = vec![0.0; 2];
        let err = update_a(&layout, &theta, &resid, &mut a, &mut short).unwrap_err();
        assert!(matches!(err, RscError::DimensionMismatch { what: "ubeta", .. }));

        let pattern = UpperPattern::new(2, vec![0, 1, 2], vec![0, 1]).unwrap();
        let mut small = SymmetricCsc::zeros(pattern);
        let err = update_a(&layout, &theta, &resid, &mut small, &mut ubeta).unwrap_err();
        assert!(matches!(err, RscError::DimensionMismatch { what: "A", expected: 3, actual: 2 }));
    }

    #[test]
    fn test_identity_seed_violation() {
        let layout = intercept_slope_layout();
        // column 1 ends at row 0 instead of its diagonal
        let pattern = UpperPattern::new(3, vec![0, 1, 2, 5], vec![0, 0, 0, 1, 2]).unwrap();
        let mut a = SymmetricCsc::zeros(pattern);
        let mut ubeta = vec![0.0; 3];

        let err = update_a(&layout, &[1.0, 0.0, 1.0], &[1.0; 3], &mut a, &mut ubeta).unwrap_err();
        assert!(matches!(
            err,
            RscError::Pattern(PatternViolation::IdentitySeed { column: 1, last_row: Some(0) })
        ));
    }

    #[test]
    fn test_missing_fixed_effect_diagonal() {
        let layout = intercept_slope_layout();
        // column 2 (the fixed effect) lacks its diagonal
        let pattern = UpperPattern::new(3, vec![0, 1, 3, 5], vec![0, 0, 1, 0, 1]).unwrap();
        let mut a = SymmetricCsc::zeros(pattern);
        let mut ubeta = vec![0.0; 3];

        let err = update_a(&layout, &[1.0, 0.0, 1.0], &[1.0; 3], &mut a, &mut ubeta).unwrap_err();
        assert!(matches!(
            err,
            RscError::Pattern(PatternViolation::MissingDiagonal { column: 2, last_row: Some(1) })
        ));
    }

    #[test]
    fn test_pattern_mismatch() {
        let layout = intercept_slope_layout();
        // (0, 2) is needed by every observation but absent
        let pattern = UpperPattern::new(3, vec![0, 1, 3, 5], vec![0, 0, 1, 1, 2]).unwrap();
        let mut a = SymmetricCsc::zeros(pattern);
        let mut ubeta = vec![0.0; 3];

        let err = update_a(&layout, &[1.0, 0.0, 1.0], &[1.0; 3], &mut a, &mut ubeta).unwrap_err();
        assert!(matches!(
            err,
            RscError::Pattern(PatternViolation::PatternMismatch { column: 2, row: 0, observation: 0 })
        ));
    }

    #[test]
    fn test_parallel_matches_serial() {
        let layout = two_group_layout();
        let theta = [0.75];
        let resid = [0.5, -1.0, 2.0];

        let (mut serial, mut serial_ubeta) = blank(&layout);
        update_a(&layout, &theta, &resid, &mut serial, &mut serial_ubeta).unwrap();

        for chunk_size in [1, 2, 3, 10] {
            let (mut par, mut par_ubeta) = blank(&layout);
            update_a_par(&layout, &theta, &resid, &mut par, &mut par_ubeta, chunk_size).unwrap();
            for (x, y) in par.values().iter().zip(serial.values()) {
                assert_relative_eq!(*x, *y, epsilon = 1e-12);
            }
            for (x, y) in par_ubeta.iter().zip(&serial_ubeta) {
                assert_relative_eq!(*x, *y, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_parallel_reports_pattern_errors() {
        let layout = intercept_slope_layout();
        let pattern = UpperPattern::new(3, vec![0, 1, 3, 5], vec![0, 0, 1, 1, 2]).unwrap();
        let mut a = SymmetricCsc::zeros(pattern);
        let mut ubeta = vec![0.0; 3];

        let err = update_a_par(&layout, &[1.0, 0.0, 1.0], &[1.0; 3], &mut a, &mut ubeta, 1)
            .unwrap_err();
        assert!(matches!(err, RscError::Pattern(PatternViolation::PatternMismatch { .. })));
    }

    #[test]
    fn test_parallel_rejects_zero_chunk() {
        let layout = two_group_layout();
        let (mut a, mut ubeta) = blank(&layout);
        assert!(update_a_par(&layout, &[1.0], &[1.0; 3], &mut a, &mut ubeta, 0).is_err());
    }

    #[test]
    fn test_update_with_dedicated_pool() {
        let layout = intercept_slope_layout();
        let config = AccumulateConfig {
            parallel: true,
            chunk_size: 1,
            num_threads: Some(2),
        };
        let (mut a, mut ubeta) = blank(&layout);
        update_a_with(&config, &layout, &[1.0, 0.0, 1.0], &[1.0, 2.0, 3.0], &mut a, &mut ubeta)
            .unwrap();

        assert_eq!(a.values(), &[4.0, 6.0, 15.0, 3.0, 5.0, 5.0]);
        assert_eq!(ubeta, vec![6.0, 14.0, 5.0]);
    }

    #[test]
    fn test_update_csc_in_place() {
        let layout = intercept_slope_layout();
        let mut csc = SymmetricCsc::zeros(UpperPattern::from_layout(&layout)).to_csc();
        let mut ubeta = vec![0.0; 3];

        update_a_csc(&layout, &[1.0, 0.0, 1.0], &[1.0, 2.0, 3.0], &mut csc, &mut ubeta).unwrap();

        assert_eq!(csc.data(), &[4.0, 6.0, 15.0, 3.0, 5.0, 5.0]);
        assert_eq!(csc.get(1, 2).copied(), Some(5.0));
    }
}
