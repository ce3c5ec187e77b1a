//! Integration testing framework for stress-runner
//!
//! Drives the built `stress-runner` and `shm-validate` binaries end to end.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{fixtures, RunnerHarness, TestProcess};
