//! # Module: self_tune
//!
//! Watches live performance and paces the loop.
//!
//! ## Sub-modules
//! - [`degradation`]: flags regressions of live metrics against the baseline
//! - [`pacing`]: adaptive sleep between iterations
//! - [`orchestrator`]: the improvement loop task, its handle and stop token

pub mod degradation;
pub mod pacing;
pub mod orchestrator;
