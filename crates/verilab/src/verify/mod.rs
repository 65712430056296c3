//! Verification checks run against a recovered VM.
//!
//! Checks are trait objects behind `VerificationCheck`; each one turns
//! whatever happens (probe success, probe failure, transport error) into a
//! `CheckOutcome`. Failures are results, not errors, so one broken check can
//! never take down a run.

pub mod checks;
pub mod runner;

use async_trait::async_trait;

pub use checks::{build_checks, rewrite_probe_url};
pub use runner::run_checks;

/// The recovered VM a check probes: the synthetic clone, not the source
/// workload. `address` is the first guest address the management API
/// discovered, when there is one.
#[derive(Debug, Clone)]
pub struct RecoveredVm {
    pub name: String,
    pub vm_id: String,
    pub address: Option<String>,
}

/// Uniform result every check produces. `passed` is the verdict; `detail`
/// is a human-readable line (latency, status code, error text).
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self { passed: true, detail: detail.into() }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self { passed: false, detail: detail.into() }
    }
}

/// One verification check. Implementations must not panic and must not
/// return an error type: anything that goes wrong is a failed outcome.
#[async_trait]
pub trait VerificationCheck: Send + Sync {
    /// Stable name stamped into the test result.
    fn name(&self) -> &str;

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome;
}
