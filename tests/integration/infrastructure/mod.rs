pub mod fixtures;
pub mod process_harness;

pub use process_harness::{RunnerHarness, TestProcess};
