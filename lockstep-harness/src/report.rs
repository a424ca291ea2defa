//! Run outcome aggregation and export.

use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// How one worker's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerOutcome {
    /// Setup, work and cleanup all succeeded.
    Passed,
    /// Setup, work or cleanup returned an error.
    Failed,
    /// The worker was terminated after being failed out of the run.
    Killed,
    /// The worker panicked outside the termination protocol.
    Panicked,
}

/// One worker's slice of the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: String,
    pub outcome: WorkerOutcome,
    /// Errors attributed to this worker, in the order they happened.
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

/// Aggregated result of one harness run, in worker-registry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: String,
    pub total: usize,
    pub passed: usize,
    pub reports: Vec<WorkerReport>,
    /// Every failure cause of the run, prefixed with the worker name.
    pub causes: Vec<String>,
}

impl RunSummary {
    pub(crate) fn collect(run: &str, reports: Vec<WorkerReport>) -> Self {
        let passed = reports
            .iter()
            .filter(|r| r.outcome == WorkerOutcome::Passed)
            .count();
        let causes = reports
            .iter()
            .flat_map(|r| r.errors.iter().map(|e| format!("{}: {}", r.worker, e)))
            .collect();
        Self {
            run: run.to_owned(),
            total: reports.len(),
            passed,
            reports,
            causes,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    pub fn outcome_of(&self, worker: &str) -> Option<WorkerOutcome> {
        self.reports
            .iter()
            .find(|r| r.worker == worker)
            .map(|r| r.outcome)
    }

    /// Serializes the summary as pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<(), HarnessError> {
        let json = serde_json::to_string_pretty(self)?;
        let io_err = |source| HarnessError::ReportIo {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(worker: &str, outcome: WorkerOutcome, errors: &[&str]) -> WorkerReport {
        WorkerReport {
            worker: worker.to_owned(),
            outcome,
            errors: errors.iter().map(|e| (*e).to_owned()).collect(),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_collect_counts_and_causes() {
        let summary = RunSummary::collect(
            "smoke",
            vec![
                report("w0", WorkerOutcome::Passed, &[]),
                report("w1", WorkerOutcome::Failed, &["run failed: boom"]),
                report("w2", WorkerOutcome::Killed, &[]),
            ],
        );
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert!(!summary.all_passed());
        assert_eq!(summary.causes, vec!["w1: run failed: boom"]);
        assert_eq!(summary.outcome_of("w2"), Some(WorkerOutcome::Killed));
        assert_eq!(summary.outcome_of("w9"), None);
    }

    #[test]
    fn test_all_passed_on_empty_run() {
        let summary = RunSummary::collect("empty", Vec::new());
        assert_eq!(summary.total, 0);
        assert!(summary.all_passed());
    }

    #[test]
    fn test_write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = RunSummary::collect(
            "export",
            vec![report("w0", WorkerOutcome::Panicked, &["run panicked: oops"])],
        );
        summary.write_json(&path).unwrap();

        let parsed: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.run, "export");
        assert_eq!(parsed.total, 1);
        assert_eq!(parsed.passed, 0);
        assert_eq!(parsed.outcome_of("w0"), Some(WorkerOutcome::Panicked));
        assert_eq!(parsed.causes, vec!["w0: run panicked: oops"]);
    }
}
