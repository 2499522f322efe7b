//! Command implementations.

pub mod artifacts;
pub mod records;
pub mod settings;
