//! Common Types for the Baseband Engine
//!
//! This crate provides shared types and utilities used across the baseband
//! processing pipeline.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
