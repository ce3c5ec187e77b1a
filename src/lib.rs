//! Scenario orchestration for sensor stress tests.
//!
//! The runner resolves named scenarios, supervises the sensor under test together with
//! its mock board peer, collects the outcomes into a report and optionally validates the
//! SHM data files the sensor produced.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod cli;
pub mod collector;
pub mod command_line;
pub mod environment;
pub mod error;
pub mod log_checks;
pub mod orchestrator;
pub mod port_manager;
pub mod process_manager;
pub mod registry;
pub mod report;
pub mod signals;
pub mod supervisor;
pub mod validator;

pub use error::RunnerError;
