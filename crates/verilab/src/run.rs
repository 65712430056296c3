//! Top-level run: target discovery, network resolution, tiered execution,
//! and the final report. The cleanup sweep at the end is unconditional; an
//! abort anywhere in the run still releases everything it provisioned.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use verilab_common::{RestoreTarget, RunReport};

use crate::api::adapter::ProtocolAdapter;
use crate::catalog::BackupCatalog;
use crate::cleanup;
use crate::config::Config;
use crate::resolve::{check_network_overlap, resolve_isolated_network};
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::verify::build_checks;

/// Mutable state threaded through a run: everything the report is built
/// from. Passed by reference; there is no global state.
#[derive(Default)]
pub struct RunContext {
    pub sessions: SessionStore,
    pub results: Vec<verilab_common::TestResult>,
    pub warnings: Vec<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-fatal finding in the log and the report.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Execute one verification run end to end and report on it. Never returns
/// an error: an abort becomes a failed report, after the cleanup sweep.
pub async fn run_verification_job(
    config: &Config,
    adapter: Arc<ProtocolAdapter>,
    catalog: Arc<dyn BackupCatalog>,
    dry_run: bool,
) -> RunReport {
    let started_at = Utc::now();
    if dry_run {
        info!("Dry-run: no restore, power or delete calls will be made");
    }

    let mut ctx = RunContext::new();
    let outcome = drive(config, adapter.clone(), catalog, &mut ctx, dry_run).await;
    finalize(ctx, &adapter, outcome, started_at, dry_run).await
}

async fn drive(
    config: &Config,
    adapter: Arc<ProtocolAdapter>,
    catalog: Arc<dyn BackupCatalog>,
    ctx: &mut RunContext,
    dry_run: bool,
) -> anyhow::Result<()> {
    let targets = discover_targets(config, catalog.as_ref(), ctx).await;
    if targets.is_empty() {
        anyhow::bail!("no restorable targets; nothing to verify");
    }

    let (network, auto_warning) = resolve_isolated_network(
        &adapter,
        config.recovery.isolated_network_id.as_deref(),
        config.recovery.isolated_network_name.as_deref(),
    )
    .await
    .context("resolving the isolated network")?;
    if let Some(w) = auto_warning {
        ctx.warnings.push(w);
    }
    info!("Recovering onto isolated network '{}' ({})", network.name, network.id);

    for target in &targets {
        match catalog.restore_point_metadata(target).await {
            Ok(metadata) => {
                if let Some(w) = check_network_overlap(&target.name, &metadata, &network) {
                    ctx.warn(w);
                }
            }
            Err(e) => ctx.warn(format!(
                "could not read restore-point metadata for '{}': {}",
                target.name, e
            )),
        }
    }

    let checks = build_checks(&config.verify, adapter.clone())
        .context("building the verification check list")?;

    let scheduler = Scheduler::new(
        adapter,
        catalog,
        checks,
        network,
        config.recovery.clone(),
        dry_run,
    );
    scheduler.execute(&targets, ctx).await;
    Ok(())
}

/// Resolve each configured target to its newest restore point. A target
/// with no restore point becomes a failed session rather than vanishing
/// from the report.
async fn discover_targets(
    config: &Config,
    catalog: &dyn BackupCatalog,
    ctx: &mut RunContext,
) -> Vec<RestoreTarget> {
    let mut resolved = Vec::new();
    for wanted in &config.targets {
        let candidates = match catalog.restore_targets(&wanted.job).await {
            Ok(c) => c,
            Err(e) => {
                ctx.warn(format!("catalog query for job '{}' failed: {}", wanted.job, e));
                continue;
            }
        };
        let newest = candidates
            .into_iter()
            .filter(|t| t.name == wanted.name)
            .max_by_key(|t| t.created_at);
        match newest {
            Some(mut target) => {
                // Configured tier wins over whatever the catalog recorded.
                if wanted.tier.is_some() {
                    target.tier = wanted.tier;
                }
                info!(
                    "Target '{}': restore point {} from {}",
                    target.name, target.restore_point_id, target.created_at
                );
                resolved.push(target);
            }
            None => {
                ctx.warn(format!(
                    "no restore point for '{}' in job '{}'",
                    wanted.name, wanted.job
                ));
                let mut session = crate::session::RecoverySession::new(
                    &wanted.name,
                    format!("{}{}", wanted.name, config.recovery.name_suffix),
                );
                session.mark_failed("no restore point found");
                if let Err(e) = ctx.sessions.insert(session) {
                    error!("Could not record missing target '{}': {}", wanted.name, e);
                }
            }
        }
    }
    resolved
}

/// Close out the run: sweep cleanup unconditionally, then fold the context
/// into the report. Split from `run_verification_job` so the abort path is
/// testable.
pub(crate) async fn finalize(
    mut ctx: RunContext,
    adapter: &ProtocolAdapter,
    outcome: anyhow::Result<()>,
    started_at: DateTime<Utc>,
    dry_run: bool,
) -> RunReport {
    if let Err(e) = &outcome {
        error!("Run aborted: {:#}", e);
        ctx.warnings.push(format!("run aborted: {:#}", e));
    }

    cleanup::sweep(&mut ctx.sessions, adapter, dry_run).await;

    let success = outcome.is_ok()
        && !ctx.sessions.is_empty()
        && ctx.sessions.iter().all(|s| s.verdict() == Some(true));

    let report = RunReport {
        success,
        dry_run,
        started_at,
        finished_at: Utc::now(),
        sessions: ctx.sessions.iter().map(|s| s.summary()).collect(),
        results: ctx.results,
        warnings: ctx.warnings,
    };
    info!(
        "Run finished: success={} sessions={} checks passed={} failed={} warnings={}",
        report.success,
        report.sessions.len(),
        report.passed_count(),
        report.failed_count(),
        report.warnings.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiClient, ApiGeneration, ApiResponse, FakeTransport, Method, RetryPolicy};
    use crate::catalog::FakeCatalog;
    use crate::session::RecoverySession;
    use serde_json::json;
    use std::time::Duration;
    use verilab_common::SessionStatus;

    fn adapter_over(fake: Arc<FakeTransport>) -> ProtocolAdapter {
        let policy = RetryPolicy::new(0).unwrap().with_base(Duration::from_millis(1));
        ProtocolAdapter::new(ApiClient::new(fake, policy), ApiGeneration::V4)
    }

    #[tokio::test]
    async fn test_abort_still_sweeps_provisioned_sessions() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(
            Method::Get,
            "/vms/vm-1",
            Ok(ApiResponse::ok_with_etag(
                json!({"data": {"extId": "vm-1", "name": "x", "powerState": "ON"}}),
                "W/\"1\"",
            )),
        );
        fake.route(Method::Delete, "/vms/vm-1", Ok(ApiResponse::ok(json!({}))));
        let adapter = adapter_over(fake.clone());

        let mut ctx = RunContext::new();
        let mut session = RecoverySession::new("db01", "db01-verify-1");
        session.mark_restoring();
        session.record_recovered_id("vm-1");
        ctx.sessions.insert(session).unwrap();

        let report = finalize(
            ctx,
            &adapter,
            Err(anyhow::anyhow!("management API became unreachable")),
            Utc::now(),
            false,
        )
        .await;

        assert!(!report.success);
        assert_eq!(report.sessions[0].status, SessionStatus::CleanedUp);
        assert_eq!(fake.calls_matching(Some(Method::Delete), "/vms/vm-1").len(), 1);
        assert!(report.warnings.iter().any(|w| w.contains("run aborted")));
    }

    #[tokio::test]
    async fn test_empty_session_store_is_never_a_success() {
        let fake = Arc::new(FakeTransport::new());
        let adapter = adapter_over(fake);

        let report = finalize(RunContext::new(), &adapter, Ok(()), Utc::now(), false).await;
        assert!(!report.success);
        assert!(report.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_no_targets_aborts_into_a_failed_report() {
        let fake = Arc::new(FakeTransport::new());
        let adapter = Arc::new(adapter_over(fake));
        let catalog = Arc::new(FakeCatalog::new());

        let config = Config::default();
        let report = run_verification_job(&config, adapter, catalog, false).await;

        assert!(!report.success);
        assert!(report.warnings.iter().any(|w| w.contains("nothing to verify")));
    }
}
