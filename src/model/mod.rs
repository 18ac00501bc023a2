//! Relative covariance factor application and sparse accumulation.

pub mod accumulate;
pub mod lambda;

pub use accumulate::{update_a, update_a_csc, update_a_par, update_a_with, AccumulateConfig};
pub use lambda::{apply_lambda, lambda_dense, FactorColumn, RelativeFactor};
