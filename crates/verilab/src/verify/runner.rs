//! Runs the configured checks against one recovered VM.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};

use verilab_common::TestResult;

use super::{RecoveredVm, VerificationCheck};

/// Run every check to completion, in order, and stamp each outcome into a
/// `TestResult`. A failure does not stop the remaining checks; the caller
/// gets the full picture either way.
pub async fn run_checks(
    vm: &RecoveredVm,
    checks: &[Box<dyn VerificationCheck>],
) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let started = Instant::now();
        let outcome = check.run(vm).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if outcome.passed {
            info!("[{}] {} passed ({}ms): {}", vm.name, check.name(), duration_ms, outcome.detail);
        } else {
            warn!("[{}] {} FAILED ({}ms): {}", vm.name, check.name(), duration_ms, outcome.detail);
        }

        results.push(TestResult {
            vm_name: vm.name.clone(),
            test_name: check.name().to_string(),
            passed: outcome.passed,
            detail: outcome.detail,
            duration_ms,
            timestamp: Utc::now(),
        });
    }
    results
}

/// Aggregate verdict: pass iff every check passed.
pub fn all_passed(results: &[TestResult]) -> bool {
    results.iter().all(|r| r.passed)
}
