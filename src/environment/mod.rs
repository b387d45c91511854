//! Environment Management Module
//!
//! Where actions get their software from: conda environments run through
//! micromamba, and reusable wrappers resolved by name.

pub mod conda;
pub mod wrapper;

pub use conda::{ensure_env, MICROMAMBA_PATH};
pub use wrapper::{LocalWrapperRepository, ResolvedWrapper, WrapperResolver};
