//! # kinship-core
//! Foundation types and traits for address clustering.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
