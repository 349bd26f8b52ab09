//! FinLens Context Engine
//!
//! The intelligence layer between raw retrieval and the final answer:
//! - Query decomposition into a sub-query DAG
//! - Evidence stitching per sub-query
//! - Plausibility and consistency validation

pub mod decomposer;
pub mod stitcher;
pub mod validator;

pub use decomposer::{Decomposer, QueryPlan};
pub use stitcher::Stitcher;
pub use validator::Validator;
