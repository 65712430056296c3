//! Typed lookups on top of the protocol adapter: VM resolution, isolated
//! network selection with a safety check, and bounded waits for async tasks
//! and power state.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use verilab_common::{IsolatedNetwork, ResolveError, RestorePointMetadata, PowerState, WaitError};

use crate::api::adapter::{Entity, EntityKind, ProtocolAdapter, TaskState};

/// Poll interval for task and power-state waits. Short relative to the
/// minutes-scale timeouts bounding the loops.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Name fragments that mark a network as intended for isolated recovery,
/// in tie-break order: an "isolated" match outranks "sandbox", which
/// outranks "lab". Two candidates at the same rank are ambiguous.
const ISOLATED_NAME_PATTERNS: [&str; 3] = ["isolated", "sandbox", "lab"];

/// Rank of a network name for auto-detection; lower is better, None means
/// not a candidate.
pub fn rank_isolated_name(name: &str) -> Option<usize> {
    let lower = name.to_lowercase();
    ISOLATED_NAME_PATTERNS.iter().position(|p| lower.contains(p))
}

/// Find a VM by exact name. Zero or multiple matches are loud errors.
pub async fn find_vm_by_name(
    adapter: &ProtocolAdapter,
    name: &str,
) -> anyhow::Result<Entity> {
    let matches = adapter.list(EntityKind::Vm, Some(name)).await?;
    let mut exact: Vec<Entity> = matches.into_iter().filter(|e| e.name == name).collect();
    match exact.len() {
        1 => Ok(exact.remove(0)),
        0 => Err(ResolveError::NotFound { kind: "VM", name: name.to_string() }.into()),
        n => Err(ResolveError::Ambiguous { kind: "VM", name: name.to_string(), count: n }.into()),
    }
}

/// Fetch a VM by id as a canonical entity.
pub async fn get_vm(adapter: &ProtocolAdapter, id: &str) -> anyhow::Result<Entity> {
    Ok(adapter.get(EntityKind::Vm, id).await?)
}

fn network_from_entity(entity: &Entity) -> IsolatedNetwork {
    IsolatedNetwork {
        name: entity.name.clone(),
        id: entity.id.clone(),
        vlan_tag: entity.vlan_tag,
        cluster_id: entity.cluster_id.clone(),
        subnet_kind: entity.subnet_kind.clone(),
    }
}

/// Resolve the isolated network to recover onto.
///
/// Precedence: explicit id, then explicit name, then auto-detection by name
/// pattern. Auto-detection never silently picks a production-looking
/// network: zero or ambiguous candidates are errors, and a successful guess
/// is surfaced as a warning so it can be pinned in config.
pub async fn resolve_isolated_network(
    adapter: &ProtocolAdapter,
    explicit_id: Option<&str>,
    explicit_name: Option<&str>,
) -> anyhow::Result<(IsolatedNetwork, Option<String>)> {
    if let Some(id) = explicit_id {
        let entity = adapter.get(EntityKind::Subnet, id).await?;
        info!("Isolated network '{}' resolved by id", entity.name);
        return Ok((network_from_entity(&entity), None));
    }

    if let Some(name) = explicit_name {
        let networks = adapter.list(EntityKind::Subnet, Some(name)).await?;
        let mut exact: Vec<Entity> = networks.into_iter().filter(|e| e.name == name).collect();
        return match exact.len() {
            1 => {
                let entity = exact.remove(0);
                info!("Isolated network '{}' resolved by name", entity.name);
                Ok((network_from_entity(&entity), None))
            }
            0 => Err(ResolveError::NotFound { kind: "network", name: name.to_string() }.into()),
            n => Err(ResolveError::Ambiguous {
                kind: "network",
                name: name.to_string(),
                count: n,
            }
            .into()),
        };
    }

    // Auto-detect across all networks.
    let networks = adapter.list(EntityKind::Subnet, None).await?;
    let mut candidates: Vec<(usize, &Entity)> = networks
        .iter()
        .filter_map(|e| rank_isolated_name(&e.name).map(|rank| (rank, e)))
        .collect();
    if candidates.is_empty() {
        return Err(ResolveError::NoIsolatedNetwork.into());
    }
    candidates.sort_by_key(|(rank, _)| *rank);
    let best_rank = candidates[0].0;
    let at_best: Vec<&Entity> = candidates
        .iter()
        .filter(|(rank, _)| *rank == best_rank)
        .map(|(_, e)| *e)
        .collect();
    if at_best.len() > 1 {
        return Err(ResolveError::AmbiguousIsolatedNetwork { count: at_best.len() }.into());
    }

    let entity = at_best[0];
    let warning = format!(
        "auto-detected isolated network '{}'; set recovery.isolated_network_name to pin it",
        entity.name
    );
    warn!("{}", warning);
    Ok((network_from_entity(entity), Some(warning)))
}

/// Safety check: the network we recover onto must not be one the source
/// workload was attached to in production. An overlap points at a
/// misconfigured "isolated" network and is surfaced as a warning, not a
/// hard failure.
pub fn check_network_overlap(
    source_name: &str,
    metadata: &RestorePointMetadata,
    network: &IsolatedNetwork,
) -> Option<String> {
    let overlapping = metadata.nics.iter().any(|nic| nic.network_id == network.id);
    if overlapping {
        Some(format!(
            "isolated network '{}' ({}) is also a production network of '{}'; \
             recovery will proceed but the network is not actually isolated",
            network.name, network.id, source_name
        ))
    } else {
        None
    }
}

/// Poll an async task until it reaches a terminal state or the deadline
/// passes. The deadline is computed once at entry so slow polls cannot
/// stretch the wait.
pub async fn wait_for_task(
    adapter: &ProtocolAdapter,
    handle: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_task_with(adapter, handle, timeout, POLL_INTERVAL).await
}

pub(crate) async fn wait_for_task_with(
    adapter: &ProtocolAdapter,
    handle: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        match adapter.get_task(handle).await {
            Ok(task) => match task.state {
                TaskState::Succeeded => return Ok(()),
                TaskState::Failed => {
                    return Err(WaitError::Failed {
                        handle: handle.to_string(),
                        detail: task.detail.unwrap_or_else(|| "no detail supplied".to_string()),
                    })
                }
                TaskState::Running => {}
            },
            Err(e) if e.is_retryable() => {
                // Transient poll failure; the deadline still bounds us.
                warn!("Task {} poll failed transiently: {}", handle, e);
            }
            Err(e) => {
                return Err(WaitError::Failed { handle: handle.to_string(), detail: e.to_string() })
            }
        }
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                handle: handle.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        sleep(interval).await;
    }
}

/// Poll a VM until it reports powered-on, bounded by a deadline computed
/// once at entry.
pub async fn wait_for_power_on(
    adapter: &ProtocolAdapter,
    vm_id: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_power_on_with(adapter, vm_id, timeout, POLL_INTERVAL).await
}

pub(crate) async fn wait_for_power_on_with(
    adapter: &ProtocolAdapter,
    vm_id: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        match adapter.get(EntityKind::Vm, vm_id).await {
            Ok(vm) if vm.power_state == PowerState::On => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!("Power-state poll for {} failed transiently: {}", vm_id, e);
            }
            Err(e) => {
                return Err(WaitError::Failed { handle: vm_id.to_string(), detail: e.to_string() })
            }
        }
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                handle: vm_id.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        sleep(interval).await;
    }
}
