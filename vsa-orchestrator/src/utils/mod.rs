//! Utility modules.

pub mod errors;
pub mod logger;
pub mod poll;
