//! Per-VM recovery session lifecycle.
//!
//! A session is created before the first network call of a restore, so a
//! crash mid-run always leaves a record the cleanup sweep can find. Normal
//! processing only ever changes a session's status; records are never
//! removed, which keeps the audit trail intact for post-mortems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use verilab_common::{SessionStatus, SessionSummary};

/// Mutable unit of orchestration state for one recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    /// Original workload name.
    pub source_name: String,
    /// Synthetic name the recovered copy runs under. Unique per run.
    pub recovery_name: String,
    recovered_id: Option<String>,
    pub restore_method: String,
    status: SessionStatus,
    /// Verdict of the verification stage. Survives the cleanup transition.
    verdict: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl RecoverySession {
    pub fn new(source_name: impl Into<String>, recovery_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            recovery_name: recovery_name.into(),
            recovered_id: None,
            restore_method: "pending".to_string(),
            status: SessionStatus::Pending,
            verdict: None,
            started_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn recovered_id(&self) -> Option<&str> {
        self.recovered_id.as_deref()
    }

    pub fn verdict(&self) -> Option<bool> {
        self.verdict
    }

    /// The recovered-resource id transitions null -> non-null exactly once.
    pub fn record_recovered_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match &self.recovered_id {
            None => self.recovered_id = Some(id),
            Some(existing) => warn!(
                "Session '{}' already tracks resource {}; ignoring {}",
                self.recovery_name, existing, id
            ),
        }
    }

    pub fn mark_restoring(&mut self) {
        self.transition(SessionStatus::Restoring, &[SessionStatus::Pending]);
    }

    pub fn mark_powered_on(&mut self) {
        self.transition(SessionStatus::PoweredOn, &[SessionStatus::Restoring]);
    }

    pub fn mark_testing(&mut self) {
        self.transition(SessionStatus::Testing, &[SessionStatus::PoweredOn]);
    }

    pub fn mark_passed(&mut self) {
        self.verdict = Some(true);
        self.transition(SessionStatus::Passed, &[SessionStatus::Testing]);
    }

    /// Reachable from any live state.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        if matches!(self.status, SessionStatus::CleanedUp) {
            warn!("Session '{}' already cleaned up; dropping failure: {}", self.recovery_name, error);
            return;
        }
        self.verdict = Some(false);
        self.last_error = Some(error);
        self.status = SessionStatus::Failed;
    }

    /// True when the session still holds (or may hold) a provisioned
    /// resource the sweep must tear down.
    pub fn needs_cleanup(&self) -> bool {
        self.status != SessionStatus::CleanedUp
    }

    /// Terminal transition. Idempotent: cleaning an already-cleaned session
    /// is a no-op, not an error. The recovered id is kept for the audit
    /// trail; only the status flips.
    pub fn mark_cleaned_up(&mut self) {
        if self.status != SessionStatus::CleanedUp {
            self.status = SessionStatus::CleanedUp;
        }
    }

    fn transition(&mut self, to: SessionStatus, from: &[SessionStatus]) {
        if from.contains(&self.status) {
            self.status = to;
        } else {
            warn!(
                "Session '{}': invalid transition {} -> {}, keeping {}",
                self.recovery_name, self.status, to, self.status
            );
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            source_name: self.source_name.clone(),
            recovery_name: self.recovery_name.clone(),
            recovered_id: self.recovered_id.clone(),
            restore_method: self.restore_method.clone(),
            status: self.status,
            verdict: self.verdict,
            started_at: self.started_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// All sessions of a run, keyed by unique synthetic recovery names.
/// Append-mostly; insertion order is preserved for reporting.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<RecoverySession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Recovery names must be unique; a collision would
    /// mean two concurrent recoveries fighting over one identity.
    pub fn insert(&mut self, session: RecoverySession) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.sessions.iter().any(|s| s.recovery_name == session.recovery_name),
            "recovery name '{}' already in use",
            session.recovery_name
        );
        self.sessions.push(session);
        Ok(())
    }

    pub fn get_mut(&mut self, recovery_name: &str) -> Option<&mut RecoverySession> {
        self.sessions.iter_mut().find(|s| s.recovery_name == recovery_name)
    }

    pub fn get(&self, recovery_name: &str) -> Option<&RecoverySession> {
        self.sessions.iter().find(|s| s.recovery_name == recovery_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecoverySession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RecoverySession> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RecoverySession {
        RecoverySession::new("db01", "db01-verify-1234")
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.status(), SessionStatus::Pending);
        s.mark_restoring();
        assert_eq!(s.status(), SessionStatus::Restoring);
        s.mark_powered_on();
        s.mark_testing();
        s.mark_passed();
        assert_eq!(s.status(), SessionStatus::Passed);
        assert_eq!(s.verdict(), Some(true));
        s.mark_cleaned_up();
        assert_eq!(s.status(), SessionStatus::CleanedUp);
        // Verdict survives cleanup.
        assert_eq!(s.verdict(), Some(true));
    }

    #[test]
    fn test_failed_reachable_from_any_live_state() {
        for setup in [0usize, 1, 2, 3] {
            let mut s = session();
            if setup >= 1 {
                s.mark_restoring();
            }
            if setup >= 2 {
                s.mark_powered_on();
            }
            if setup >= 3 {
                s.mark_testing();
            }
            s.mark_failed("boom");
            assert_eq!(s.status(), SessionStatus::Failed);
            assert_eq!(s.last_error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn test_recovered_id_set_at_most_once() {
        let mut s = session();
        s.record_recovered_id("vm-1");
        s.record_recovered_id("vm-2");
        assert_eq!(s.recovered_id(), Some("vm-1"));
    }

    #[test]
    fn test_recovered_id_survives_cleanup() {
        let mut s = session();
        s.mark_restoring();
        s.record_recovered_id("vm-1");
        s.mark_cleaned_up();
        assert_eq!(s.recovered_id(), Some("vm-1"));
        assert_eq!(s.status(), SessionStatus::CleanedUp);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_terminal() {
        let mut s = session();
        s.mark_restoring();
        s.mark_cleaned_up();
        s.mark_cleaned_up();
        assert_eq!(s.status(), SessionStatus::CleanedUp);
        assert!(!s.needs_cleanup());

        // Failure after cleanup is dropped, not applied.
        s.mark_failed("late error");
        assert_eq!(s.status(), SessionStatus::CleanedUp);
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let mut s = session();
        // Testing requires PoweredOn first.
        s.mark_testing();
        assert_eq!(s.status(), SessionStatus::Pending);
    }

    #[test]
    fn test_store_rejects_duplicate_names() {
        let mut store = SessionStore::new();
        store.insert(session()).unwrap();
        assert!(store.insert(session()).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_preserves_insertion_order() {
        let mut store = SessionStore::new();
        store.insert(RecoverySession::new("a", "a-1")).unwrap();
        store.insert(RecoverySession::new("b", "b-1")).unwrap();
        let names: Vec<&str> = store.iter().map(|s| s.source_name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
