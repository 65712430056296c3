//! Cleanup sweep: tear down every recovered resource a run provisioned.
//!
//! The sweep walks the whole session store, not just the batch that ran
//! last, so a fatal abort mid-run still releases everything that was
//! created. One session failing to clean never stops the rest.

use tracing::{error, info};

use verilab_common::SessionStatus;

use crate::api::adapter::{EntityKind, ProtocolAdapter};
use crate::session::SessionStore;

/// Clean up every session not yet `CleanedUp`. Returns how many sessions
/// were transitioned; sessions whose teardown failed keep their state so a
/// later sweep (or an operator) can retry.
pub async fn sweep(store: &mut SessionStore, adapter: &ProtocolAdapter, dry_run: bool) -> usize {
    let mut cleaned = 0usize;
    for session in store.iter_mut() {
        if !session.needs_cleanup() {
            continue;
        }
        // A session that never started (skipped target) holds nothing and
        // stays in the report as-is.
        if session.status() == SessionStatus::Pending && session.recovered_id().is_none() {
            continue;
        }

        match session.recovered_id().map(String::from) {
            None => {
                // Nothing was provisioned; just close the record.
                session.mark_cleaned_up();
                cleaned += 1;
            }
            Some(_) if dry_run => {
                info!("[dry-run] would delete recovered VM for '{}'", session.recovery_name);
                session.mark_cleaned_up();
                cleaned += 1;
            }
            Some(id) => match adapter.delete(EntityKind::Vm, &id).await {
                Ok(()) => {
                    info!("Deleted recovered VM {} ('{}')", id, session.recovery_name);
                    session.mark_cleaned_up();
                    cleaned += 1;
                }
                Err(e) => {
                    error!(
                        "Cleanup of '{}' (VM {}) failed, continuing sweep: {}",
                        session.recovery_name, id, e
                    );
                }
            },
        }
    }
    if cleaned > 0 {
        info!("Cleanup sweep closed {} session(s)", cleaned);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::context::ApiGeneration;
    use crate::api::retry::RetryPolicy;
    use crate::api::transport::{ApiClient, ApiResponse, FakeTransport, Method};
    use verilab_common::ApiError;
    use crate::session::RecoverySession;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use verilab_common::SessionStatus;

    fn adapter_over(fake: Arc<FakeTransport>) -> ProtocolAdapter {
        let policy = RetryPolicy::new(0).unwrap().with_base(Duration::from_millis(1));
        ProtocolAdapter::new(ApiClient::new(fake, policy), ApiGeneration::V3)
    }

    fn session_with_vm(suffix: &str, vm_id: &str) -> RecoverySession {
        let mut s = RecoverySession::new(format!("src{}", suffix), format!("rec{}", suffix));
        s.mark_restoring();
        s.record_recovered_id(vm_id);
        s
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(Method::Delete, "/vms/", Ok(ApiResponse::ok(json!({}))));
        let adapter = adapter_over(fake.clone());

        let mut store = SessionStore::new();
        store.insert(session_with_vm("1", "vm-1")).unwrap();

        assert_eq!(sweep(&mut store, &adapter, false).await, 1);
        // Second sweep finds nothing to do and issues no further deletes.
        assert_eq!(sweep(&mut store, &adapter, false).await, 0);
        assert_eq!(fake.calls_matching(Some(Method::Delete), "/vms/").len(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_sweep() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(
            Method::Delete,
            "/vms/vm-1",
            Err(ApiError::Client { status: 409, detail: "resource busy".into() }),
        );
        fake.route(Method::Delete, "/vms/vm-2", Ok(ApiResponse::ok(json!({}))));
        let adapter = adapter_over(fake);

        let mut store = SessionStore::new();
        store.insert(session_with_vm("1", "vm-1")).unwrap();
        store.insert(session_with_vm("2", "vm-2")).unwrap();

        assert_eq!(sweep(&mut store, &adapter, false).await, 1);
        assert_eq!(store.get("rec1").unwrap().status(), SessionStatus::Restoring);
        assert_eq!(store.get("rec2").unwrap().status(), SessionStatus::CleanedUp);
    }

    #[tokio::test]
    async fn test_started_session_without_resource_closes_without_calls() {
        let fake = Arc::new(FakeTransport::new());
        let adapter = adapter_over(fake.clone());

        let mut store = SessionStore::new();
        let mut session = RecoverySession::new("src", "rec");
        session.mark_restoring();
        session.mark_failed("restore initiation failed");
        store.insert(session).unwrap();

        assert_eq!(sweep(&mut store, &adapter, false).await, 1);
        assert_eq!(fake.call_count(), 0);
        assert_eq!(store.get("rec").unwrap().status(), SessionStatus::CleanedUp);
    }

    #[tokio::test]
    async fn test_never_started_session_is_left_in_the_report() {
        let fake = Arc::new(FakeTransport::new());
        let adapter = adapter_over(fake.clone());

        let mut store = SessionStore::new();
        let mut session = RecoverySession::new("src", "rec");
        session.last_error = Some("skipped: tier 1 halted after a verification failure".into());
        store.insert(session).unwrap();

        assert_eq!(sweep(&mut store, &adapter, false).await, 0);
        assert_eq!(fake.call_count(), 0);
        assert_eq!(store.get("rec").unwrap().status(), SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_dry_run_never_deletes() {
        let fake = Arc::new(FakeTransport::new());
        let adapter = adapter_over(fake.clone());

        let mut store = SessionStore::new();
        store.insert(session_with_vm("1", "vm-1")).unwrap();

        assert_eq!(sweep(&mut store, &adapter, true).await, 1);
        assert_eq!(fake.call_count(), 0);
        assert_eq!(store.get("rec1").unwrap().status(), SessionStatus::CleanedUp);
    }
}
