//! Regular Sparse Column accumulation for mixed-effects models
//!
//! This library assembles the penalized cross-product matrix and right-hand
//! side of one penalized least-squares step for a linear mixed model, given
//! the current variance-component parameters `theta`.
//!
//! # Overview
//!
//! The library is organized into two modules:
//!
//! - **data**: The observation layout (`RscLayout`) and upper-triangle
//!   symmetric CSC storage (`UpperPattern`, `SymmetricCsc`)
//! - **model**: Relative covariance factor application (`apply_lambda`) and
//!   sparse accumulation (`update_a`, serial or parallel)
//!
//! The layout and pattern are built once per model. Each optimizer step then
//! only rewrites the stored values of `A` and the dense vector `ubeta`.
//!
//! # Example
//!
//! ```
//! use regular_sparse::prelude::*;
//! use nalgebra::DMatrix;
//!
//! // Random intercept and slope for one group, plus one fixed effect.
//! let rv = DMatrix::from_column_slice(2, 2, &[0, 1, 0, 1]);
//! let xv = DMatrix::from_column_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
//! let layout = RscLayout::new(rv, xv, vec![0.0, f64::NEG_INFINITY, 0.0]).unwrap();
//!
//! let mut a = SymmetricCsc::zeros(UpperPattern::from_layout(&layout));
//! let mut ubeta = vec![0.0; layout.order()];
//! let theta = layout.factor().identity_theta();
//! update_a(&layout, &theta, &[1.0, 1.0], &mut a, &mut ubeta).unwrap();
//!
//! assert_eq!(a.get(0, 0), 3.0);
//! assert_eq!(ubeta, vec![2.0, 1.0, 2.0]);
//! ```

pub mod data;
pub mod error;
pub mod model;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::data::{RscLayout, SymmetricCsc, UpperPattern};
    pub use crate::error::{PatternViolation, Result, RscError};
    pub use crate::model::{
        apply_lambda, lambda_dense, update_a, update_a_csc, update_a_par, update_a_with,
        AccumulateConfig, FactorColumn, RelativeFactor,
    };
}
