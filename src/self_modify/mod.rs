//! # Module: self_modify
//!
//! Everything that happens to one candidate improvement after discovery:
//! queueing, isolated testing, the deployment decision, phased rollout with
//! automatic rollback, and the history of outcomes.
//!
//! ## Sub-modules
//! - [`queue`]: max-priority queue of pending improvements
//! - [`pool`]: bounded batch evaluation (default 3 in flight)
//! - [`harness`]: test harness contract and result assembly
//! - [`gate`]: deployment decision criteria and per-phase quality gates
//! - [`deployment`]: phased rollout / rollback state machine
//! - [`memory`]: improvement history, queries and reports
//! - `sqlite_log`: optional SQLite mirror of the history (`sqlite-log`)

pub mod queue;
pub mod pool;
pub mod harness;
pub mod gate;
pub mod deployment;
pub mod memory;

#[cfg(feature = "sqlite-log")]
pub mod sqlite_log;
