//! Types, errors and traits shared across components

pub mod errors;
pub mod latency;
pub mod traits;
pub mod types;
