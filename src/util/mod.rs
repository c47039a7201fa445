//! Helpers shared by the pipeline steps.

pub mod lock;
pub mod retention;
pub mod signal;
