//! Single-group Raft consensus core with an in-process group harness.

pub mod accumulator;
pub mod config;
pub mod group;
pub mod metrics;
pub mod raft;
