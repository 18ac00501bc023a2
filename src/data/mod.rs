//! Layout and storage structures for the penalized cross-product.

mod layout;
mod symmetric;

pub use layout::RscLayout;
pub use symmetric::{SymmetricCsc, UpperPattern};
