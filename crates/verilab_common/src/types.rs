//! Core data model for recovery verification runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consistency level of a restore point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    ApplicationConsistent,
    CrashConsistent,
}

/// A protected workload to recover. Immutable once discovered; produced by
/// the backup-catalog collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTarget {
    /// Original workload name.
    pub name: String,
    /// Source job or backup identifier in the catalog.
    pub job_id: String,
    /// Restore point to recover from.
    pub restore_point_id: String,
    /// When the restore point was taken.
    pub created_at: DateTime<Utc>,
    pub consistency: Consistency,
    /// Declared boot tier. Targets without one run in the implicit final tier.
    pub tier: Option<u32>,
}

/// A network segment with no route to production, safe for booting
/// recovered workloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedNetwork {
    pub name: String,
    pub id: String,
    pub vlan_tag: Option<u32>,
    pub cluster_id: Option<String>,
    pub subnet_kind: Option<String>,
}

/// A network adapter on the source workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicInfo {
    pub mac_address: String,
    pub network_id: String,
}

/// Metadata the backup catalog exposes for a restore point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePointMetadata {
    pub nics: Vec<NicInfo>,
    pub storage_cluster: Option<String>,
}

/// Power state reported by the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

/// Lifecycle states of a recovery session.
///
/// `Failed` is reachable from any live state. `CleanedUp` is terminal;
/// re-invoking cleanup on a cleaned session is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Restoring,
    PoweredOn,
    Testing,
    Passed,
    Failed,
    CleanedUp,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Restoring => "restoring",
            SessionStatus::PoweredOn => "powered_on",
            SessionStatus::Testing => "testing",
            SessionStatus::Passed => "passed",
            SessionStatus::Failed => "failed",
            SessionStatus::CleanedUp => "cleaned_up",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single verification check against a recovered VM.
/// Produced exactly once per (VM, check) pair; immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub vm_name: String,
    pub test_name: String,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_display() {
        assert_eq!(SessionStatus::PoweredOn.to_string(), "powered_on");
        assert_eq!(SessionStatus::CleanedUp.to_string(), "cleaned_up");
    }

    #[test]
    fn test_status_round_trips_through_serde() {
        let json = serde_json::to_string(&SessionStatus::Restoring).unwrap();
        assert_eq!(json, "\"restoring\"");
    }
}
