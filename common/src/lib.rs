//! Shared domain types for the DVR video harvester.

pub mod types;
pub mod utils;

pub use types::*;
