//! Read-only reporting contract.
//!
//! Renderers (HTML, CSV, plain text) consume this and nothing else; the core
//! never depends on a report format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SessionStatus, TestResult};

/// Snapshot of one recovery session at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub source_name: String,
    pub recovery_name: String,
    pub recovered_id: Option<String>,
    pub restore_method: String,
    pub status: SessionStatus,
    /// Verdict of the verification stage, if the session got that far.
    pub verdict: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Final output of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// True iff every target's required verifications passed.
    pub success: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sessions: Vec<SessionSummary>,
    pub results: Vec<TestResult>,
    /// Non-fatal findings surfaced during the run, e.g. an isolated network
    /// overlapping a source workload's production network.
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(passed: bool) -> TestResult {
        TestResult {
            vm_name: "db01".into(),
            test_name: "heartbeat".into(),
            passed,
            detail: String::new(),
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_report_counts() {
        let report = RunReport {
            success: false,
            dry_run: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            sessions: vec![],
            results: vec![result(true), result(true), result(false)],
            warnings: vec![],
        };
        assert_eq!(report.passed_count(), 2);
        assert_eq!(report.failed_count(), 1);
    }
}
