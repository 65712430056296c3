//! Boot-order scheduler.
//!
//! Targets run in tiers: declared tiers ascending, then one implicit
//! catch-all tier for everything untitred. Within a tier, targets run in
//! chunks no larger than the concurrency ceiling; each chunk moves through
//! restore, power-on wait, verification and cleanup before the next chunk
//! starts. A verification failure halts every subsequent tier, so a broken
//! database tier never boots the app servers that depend on it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use verilab_common::{IsolatedNetwork, RestoreTarget, SessionStatus, TestResult};

use crate::api::adapter::{EntityKind, ProtocolAdapter};
use crate::catalog::BackupCatalog;
use crate::cleanup;
use crate::config::RecoveryConfig;
use crate::resolve::{wait_for_power_on, wait_for_task};
use crate::run::RunContext;
use crate::session::RecoverySession;
use crate::verify::{run_checks, runner::all_passed, RecoveredVm, VerificationCheck};

/// Boot tier. Derived ordering runs declared tiers ascending and the
/// catch-all last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Declared(u32),
    CatchAll,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Declared(n) => write!(f, "tier {}", n),
            Tier::CatchAll => write!(f, "catch-all tier"),
        }
    }
}

/// Group targets by tier, preserving input order within each group.
pub fn plan_tiers(targets: &[RestoreTarget]) -> BTreeMap<Tier, Vec<RestoreTarget>> {
    let mut plan: BTreeMap<Tier, Vec<RestoreTarget>> = BTreeMap::new();
    for target in targets {
        let tier = target.tier.map(Tier::Declared).unwrap_or(Tier::CatchAll);
        plan.entry(tier).or_default().push(target.clone());
    }
    plan
}

/// Executes the tiered recovery plan. Dry-run takes the identical batching
/// and ordering path; only the mutating calls are replaced by fabricated
/// "would restore" results.
pub struct Scheduler {
    adapter: Arc<ProtocolAdapter>,
    catalog: Arc<dyn BackupCatalog>,
    checks: Arc<Vec<Box<dyn VerificationCheck>>>,
    network: IsolatedNetwork,
    recovery: RecoveryConfig,
    dry_run: bool,
}

/// One target of the current batch, under its synthetic recovery name.
struct BatchEntry {
    target: RestoreTarget,
    recovery_name: String,
}

impl Scheduler {
    pub fn new(
        adapter: Arc<ProtocolAdapter>,
        catalog: Arc<dyn BackupCatalog>,
        checks: Vec<Box<dyn VerificationCheck>>,
        network: IsolatedNetwork,
        recovery: RecoveryConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            adapter,
            catalog,
            checks: Arc::new(checks),
            network,
            recovery,
            dry_run,
        }
    }

    fn recovery_name_for(&self, source: &str) -> String {
        let tag = Uuid::new_v4().simple().to_string();
        format!("{}{}-{}", source, self.recovery.name_suffix, &tag[..8])
    }

    /// Run the whole plan. Targets in tiers after a failed tier, and in
    /// batches abandoned by a same-tier failure, are recorded as skipped
    /// sessions so nothing silently disappears from the report.
    pub async fn execute(&self, targets: &[RestoreTarget], ctx: &mut RunContext) {
        let plan = plan_tiers(targets);
        let mut halted_by: Option<Tier> = None;

        for (tier, tier_targets) in &plan {
            if let Some(failed_tier) = halted_by {
                self.record_skipped(ctx, tier_targets, failed_tier);
                continue;
            }

            info!("Starting {} with {} target(s)", tier, tier_targets.len());
            let mut tier_failed = false;
            let mut chunks = tier_targets.chunks(self.recovery.max_concurrent.max(1));
            while let Some(chunk) = chunks.next() {
                let batch_ok = self.run_batch(chunk, ctx).await;
                if !batch_ok {
                    tier_failed = true;
                    if !self.recovery.continue_on_failure {
                        for abandoned in chunks.by_ref() {
                            self.record_skipped(ctx, abandoned, *tier);
                        }
                        break;
                    }
                }
            }

            if tier_failed {
                warn!("{} had failures; subsequent tiers will be skipped", tier);
                halted_by = Some(*tier);
            } else {
                info!("{} completed", tier);
            }
        }
    }

    fn record_skipped(&self, ctx: &mut RunContext, targets: &[RestoreTarget], failed_tier: Tier) {
        for target in targets {
            let mut session =
                RecoverySession::new(&target.name, self.recovery_name_for(&target.name));
            session.last_error =
                Some(format!("skipped: {} halted after a verification failure", failed_tier));
            warn!("Skipping '{}': {} failed earlier", target.name, failed_tier);
            if let Err(e) = ctx.sessions.insert(session) {
                error!("Could not record skipped target '{}': {}", target.name, e);
            }
        }
    }

    /// One chunk through all four phases. Returns whether every target of
    /// the chunk passed verification.
    async fn run_batch(&self, chunk: &[RestoreTarget], ctx: &mut RunContext) -> bool {
        let mut entries = Vec::with_capacity(chunk.len());
        for target in chunk {
            let recovery_name = self.recovery_name_for(&target.name);
            let mut session = RecoverySession::new(&target.name, &recovery_name);
            session.mark_restoring();
            if let Err(e) = ctx.sessions.insert(session) {
                error!("Could not open a session for '{}': {}", target.name, e);
                continue;
            }
            entries.push(BatchEntry { target: target.clone(), recovery_name });
        }

        self.phase_restore(&entries, ctx).await;
        self.phase_power_on(&entries, ctx).await;
        self.phase_verify(&entries, ctx).await;
        cleanup::sweep(&mut ctx.sessions, &self.adapter, self.dry_run).await;

        entries.iter().all(|e| {
            ctx.sessions
                .get(&e.recovery_name)
                .map(|s| s.verdict() == Some(true))
                .unwrap_or(false)
        })
    }

    async fn phase_restore(&self, entries: &[BatchEntry], ctx: &mut RunContext) {
        if self.dry_run {
            for entry in entries {
                let detail = format!(
                    "would restore '{}' from restore point {} onto '{}'",
                    entry.target.name, entry.target.restore_point_id, self.network.name
                );
                info!("[dry-run] {}", detail);
                ctx.results.push(fabricated_result(&entry.recovery_name, "would_restore", detail));
                if let Some(session) = ctx.sessions.get_mut(&entry.recovery_name) {
                    session.restore_method = "dry_run".to_string();
                }
            }
            return;
        }

        // Each task reports the handle separately from the outcome: once
        // initiation returns, the recovered VM exists and its id must reach
        // the session even when the restore task later fails or times out,
        // or the cleanup sweep has nothing to delete.
        let mut join: JoinSet<(String, Option<crate::catalog::RestoreHandle>, Result<(), String>)> =
            JoinSet::new();
        let task_timeout = Duration::from_secs(self.recovery.task_timeout_secs);
        for entry in entries {
            let catalog = self.catalog.clone();
            let adapter = self.adapter.clone();
            let network = self.network.clone();
            let target = entry.target.clone();
            let recovery_name = entry.recovery_name.clone();
            join.spawn(async move {
                let handle = match catalog.initiate_restore(&target, &recovery_name, &network).await
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        let detail = format!("restore initiation failed: {}", e);
                        return (recovery_name, None, Err(detail));
                    }
                };
                let waited = wait_for_task(&adapter, &handle.task_id, task_timeout)
                    .await
                    .map_err(|e| format!("restore task failed: {}", e));
                (recovery_name, Some(handle), waited)
            });
        }

        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((recovery_name, handle, outcome)) => {
                    if let Some(session) = ctx.sessions.get_mut(&recovery_name) {
                        if let Some(handle) = &handle {
                            session.record_recovered_id(&handle.recovered_vm_id);
                            session.restore_method = handle.restore_method.clone();
                        }
                        match outcome {
                            Ok(()) => {
                                if let Some(handle) = &handle {
                                    info!(
                                        "Restored '{}' as VM {}",
                                        recovery_name, handle.recovered_vm_id
                                    );
                                }
                            }
                            Err(detail) => {
                                error!("Restore of '{}' failed: {}", recovery_name, detail);
                                session.mark_failed(detail);
                            }
                        }
                    }
                }
                Err(e) => error!("Restore task panicked: {}", e),
            }
        }
    }

    async fn phase_power_on(&self, entries: &[BatchEntry], ctx: &mut RunContext) {
        if self.dry_run {
            for entry in entries {
                if let Some(session) = ctx.sessions.get_mut(&entry.recovery_name) {
                    session.mark_powered_on();
                }
            }
            return;
        }

        let mut join: JoinSet<(String, Result<(), String>)> = JoinSet::new();
        let timeout = Duration::from_secs(self.recovery.power_on_timeout_secs);
        for entry in entries {
            let Some(session) = ctx.sessions.get(&entry.recovery_name) else { continue };
            if session.status() != SessionStatus::Restoring {
                continue;
            }
            let Some(vm_id) = session.recovered_id().map(String::from) else { continue };
            let adapter = self.adapter.clone();
            let recovery_name = entry.recovery_name.clone();
            join.spawn(async move {
                let result =
                    wait_for_power_on(&adapter, &vm_id, timeout).await.map_err(|e| e.to_string());
                (recovery_name, result)
            });
        }

        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((recovery_name, Ok(()))) => {
                    if let Some(session) = ctx.sessions.get_mut(&recovery_name) {
                        session.mark_powered_on();
                    }
                }
                Ok((recovery_name, Err(detail))) => {
                    error!("'{}' never powered on: {}", recovery_name, detail);
                    if let Some(session) = ctx.sessions.get_mut(&recovery_name) {
                        session.mark_failed(detail);
                    }
                }
                Err(e) => error!("Power-on wait panicked: {}", e),
            }
        }
    }

    async fn phase_verify(&self, entries: &[BatchEntry], ctx: &mut RunContext) {
        if self.dry_run {
            for entry in entries {
                if let Some(session) = ctx.sessions.get_mut(&entry.recovery_name) {
                    session.mark_testing();
                    session.mark_passed();
                }
            }
            return;
        }

        let mut join: JoinSet<(String, Vec<TestResult>)> = JoinSet::new();
        for entry in entries {
            let Some(session) = ctx.sessions.get_mut(&entry.recovery_name) else { continue };
            if session.status() != SessionStatus::PoweredOn {
                continue;
            }
            session.mark_testing();
            let Some(vm_id) = session.recovered_id().map(String::from) else { continue };

            let adapter = self.adapter.clone();
            let checks = self.checks.clone();
            let recovery_name = entry.recovery_name.clone();
            join.spawn(async move {
                let address = match adapter.get(EntityKind::Vm, &vm_id).await {
                    Ok(entity) => entity.addresses.first().cloned(),
                    Err(e) => {
                        warn!("Address lookup for '{}' failed: {}", recovery_name, e);
                        None
                    }
                };
                let vm = RecoveredVm { name: recovery_name.clone(), vm_id, address };
                let results = run_checks(&vm, &checks).await;
                (recovery_name, results)
            });
        }

        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((recovery_name, results)) => {
                    let passed = all_passed(&results);
                    ctx.results.extend(results);
                    if let Some(session) = ctx.sessions.get_mut(&recovery_name) {
                        if passed {
                            session.mark_passed();
                        } else {
                            session.mark_failed("one or more verification checks failed");
                        }
                    }
                }
                Err(e) => error!("Verification task panicked: {}", e),
            }
        }
    }
}

fn fabricated_result(vm_name: &str, test_name: &str, detail: String) -> TestResult {
    TestResult {
        vm_name: vm_name.to_string(),
        test_name: test_name.to_string(),
        passed: true,
        detail,
        duration_ms: 0,
        timestamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verilab_common::Consistency;

    fn target(name: &str, tier: Option<u32>) -> RestoreTarget {
        RestoreTarget {
            name: name.to_string(),
            job_id: "nightly".to_string(),
            restore_point_id: format!("rp-{}", name),
            created_at: Utc::now(),
            consistency: Consistency::ApplicationConsistent,
            tier,
        }
    }

    #[test]
    fn test_tier_ordering_puts_catch_all_last() {
        assert!(Tier::Declared(1) < Tier::Declared(2));
        assert!(Tier::Declared(u32::MAX) < Tier::CatchAll);
    }

    #[test]
    fn test_plan_groups_by_tier_in_ascending_order() {
        let targets = vec![
            target("app01", Some(2)),
            target("db01", Some(1)),
            target("misc01", None),
            target("db02", Some(1)),
        ];
        let plan = plan_tiers(&targets);

        let tiers: Vec<Tier> = plan.keys().copied().collect();
        assert_eq!(tiers, vec![Tier::Declared(1), Tier::Declared(2), Tier::CatchAll]);

        let tier1: Vec<&str> = plan[&Tier::Declared(1)].iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tier1, vec!["db01", "db02"]);
        assert_eq!(plan[&Tier::CatchAll].len(), 1);
    }

    #[test]
    fn test_untiered_only_plan_is_one_tier() {
        let targets = vec![target("a", None), target("b", None)];
        let plan = plan_tiers(&targets);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[&Tier::CatchAll].len(), 2);
    }
}
