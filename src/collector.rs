use crate::supervisor::{RunResult, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pass/fail tally for one scenario id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
}

/// Aggregate view over a session's results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Sum of the scenarios' elapsed time, in seconds
    pub total_duration_secs: f64,
    pub per_scenario: BTreeMap<String, Tally>,
    /// Failures counted by reason kind
    pub failures_by_kind: BTreeMap<String, usize>,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Folds run results into a [`Summary`]. Pure: reads nothing but its input.
pub fn collect(results: &[RunResult]) -> Summary {
    results.iter().fold(Summary::default(), |mut summary, result| {
        summary.total += 1;
        summary.total_duration_secs += result.elapsed_secs;

        let tally = summary.per_scenario.entry(result.scenario.clone()).or_default();
        match result.status {
            RunStatus::Pass => {
                summary.passed += 1;
                tally.passed += 1;
            }
            RunStatus::Fail => {
                summary.failed += 1;
                tally.failed += 1;
            }
        }

        if let Some(reason) = &result.reason {
            *summary.failures_by_kind.entry(reason.kind().to_string()).or_default() += 1;
        }
        summary
    })
}
