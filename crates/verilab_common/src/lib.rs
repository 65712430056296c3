//! Shared types for verilab crates: data model, error taxonomy, run report.

pub mod error;
pub mod report;
pub mod types;

pub use error::{ApiError, ResolveError, WaitError};
pub use report::{RunReport, SessionSummary};
pub use types::{
    Consistency, IsolatedNetwork, NicInfo, PowerState, RestorePointMetadata, RestoreTarget,
    SessionStatus, TestResult,
};
