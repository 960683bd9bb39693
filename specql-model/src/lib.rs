//! Specification model for SpecQL
//!
//! This crate defines the entity/action specification objects consumed by the
//! SpecQL action compiler, the expression language embedded in them, and the
//! read-only catalog the compiler resolves names against.

pub mod catalog;
pub mod error;
pub mod expr;
pub mod parse;
pub mod search;
pub mod types;
pub mod utils;

pub use catalog::*;
pub use error::*;
pub use expr::*;
pub use search::*;
pub use types::*;
