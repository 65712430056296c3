//! Backup-catalog collaborator boundary.
//!
//! The catalog is a black box that discovers restore points and initiates
//! restores; its internals (catalog format, job scheduling) are out of
//! scope. Production code talks to it over HTTP; tests use `FakeCatalog`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use verilab_common::{IsolatedNetwork, RestorePointMetadata, RestoreTarget};

/// What an initiated restore hands back: the async task tracking it, the id
/// the recovered resource will carry, and how the restore is performed.
#[derive(Debug, Clone)]
pub struct RestoreHandle {
    pub task_id: String,
    pub recovered_vm_id: String,
    pub restore_method: String,
}

/// Contract surface between the core and the backup product.
#[async_trait]
pub trait BackupCatalog: Send + Sync {
    /// Restore targets discovered for a job.
    async fn restore_targets(&self, job_id: &str) -> Result<Vec<RestoreTarget>>;

    /// Network adapters and storage cluster recorded for a restore point.
    async fn restore_point_metadata(&self, target: &RestoreTarget) -> Result<RestorePointMetadata>;

    /// Initiate a restore of the target's restore point onto the isolated
    /// network, under the given synthetic name.
    async fn initiate_restore(
        &self,
        target: &RestoreTarget,
        recovery_name: &str,
        network: &IsolatedNetwork,
    ) -> Result<RestoreHandle>;
}

// ============================================================================
// HTTP catalog client
// ============================================================================

/// Thin client for the backup product's REST surface. Carries no retry or
/// protocol logic of its own; the catalog's contract is the three calls
/// above and nothing else.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCatalog {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl BackupCatalog for HttpCatalog {
    async fn restore_targets(&self, job_id: &str) -> Result<Vec<RestoreTarget>> {
        let url = format!("{}/jobs/{}/restore_points", self.base_url, job_id);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("catalog lookup failed for job '{}'", job_id))?;
        if !response.status().is_success() {
            return Err(anyhow!("catalog returned HTTP {} for job '{}'", response.status(), job_id));
        }
        let targets: Vec<RestoreTarget> = response
            .json()
            .await
            .with_context(|| format!("catalog returned malformed targets for job '{}'", job_id))?;
        info!("Catalog job '{}': {} restore target(s)", job_id, targets.len());
        Ok(targets)
    }

    async fn restore_point_metadata(&self, target: &RestoreTarget) -> Result<RestorePointMetadata> {
        let url = format!("{}/restore_points/{}/metadata", self.base_url, target.restore_point_id);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("metadata lookup failed for '{}'", target.name))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "catalog returned HTTP {} for restore point {}",
                response.status(),
                target.restore_point_id
            ));
        }
        response
            .json()
            .await
            .with_context(|| format!("malformed metadata for restore point {}", target.restore_point_id))
    }

    async fn initiate_restore(
        &self,
        target: &RestoreTarget,
        recovery_name: &str,
        network: &IsolatedNetwork,
    ) -> Result<RestoreHandle> {
        let url = format!("{}/restore_points/{}/restore", self.base_url, target.restore_point_id);
        let body = json!({
            "recovery_name": recovery_name,
            "network_id": network.id,
        });
        let response = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .with_context(|| format!("restore request failed for '{}'", target.name))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "catalog refused restore of '{}': HTTP {}",
                target.name,
                response.status()
            ));
        }
        let reply: serde_json::Value = response.json().await.context("malformed restore reply")?;
        let task_id = reply
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("restore reply missing task_id"))?
            .to_string();
        let recovered_vm_id = reply
            .get("vm_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("restore reply missing vm_id"))?
            .to_string();
        let restore_method = reply
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("instant-recovery")
            .to_string();
        Ok(RestoreHandle { task_id, recovered_vm_id, restore_method })
    }
}

// ============================================================================
// Fake catalog (testing)
// ============================================================================

/// Deterministic catalog for tests: pre-loaded targets, per-target failure
/// injection, call counting, and an in-flight gauge for concurrency
/// assertions.
#[derive(Default)]
pub struct FakeCatalog {
    targets: Mutex<HashMap<String, Vec<RestoreTarget>>>,
    metadata: Mutex<HashMap<String, RestorePointMetadata>>,
    failing_restores: Mutex<Vec<String>>,
    restore_calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Artificial latency inside initiate_restore, so overlap is observable.
    pub restore_delay: Option<Duration>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target(&self, target: RestoreTarget) {
        self.targets
            .lock()
            .unwrap()
            .entry(target.job_id.clone())
            .or_default()
            .push(target);
    }

    pub fn set_metadata(&self, name: &str, metadata: RestorePointMetadata) {
        self.metadata.lock().unwrap().insert(name.to_string(), metadata);
    }

    /// Make initiate_restore fail for this target name.
    pub fn fail_restore_of(&self, name: &str) {
        self.failing_restores.lock().unwrap().push(name.to_string());
    }

    /// Target names that received a restore call, in order.
    pub fn restore_calls(&self) -> Vec<String> {
        self.restore_calls.lock().unwrap().clone()
    }

    pub fn restore_call_count(&self, name: &str) -> usize {
        self.restore_calls.lock().unwrap().iter().filter(|n| n.as_str() == name).count()
    }

    /// Highest number of concurrently in-flight restore calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupCatalog for FakeCatalog {
    async fn restore_targets(&self, job_id: &str) -> Result<Vec<RestoreTarget>> {
        Ok(self.targets.lock().unwrap().get(job_id).cloned().unwrap_or_default())
    }

    async fn restore_point_metadata(&self, target: &RestoreTarget) -> Result<RestorePointMetadata> {
        self.metadata
            .lock()
            .unwrap()
            .get(&target.name)
            .cloned()
            .ok_or_else(|| anyhow!("no metadata scripted for '{}'", target.name))
    }

    async fn initiate_restore(
        &self,
        target: &RestoreTarget,
        _recovery_name: &str,
        _network: &IsolatedNetwork,
    ) -> Result<RestoreHandle> {
        self.restore_calls.lock().unwrap().push(target.name.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.restore_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_restores.lock().unwrap().contains(&target.name) {
            return Err(anyhow!("restore of '{}' rejected by catalog", target.name));
        }
        Ok(RestoreHandle {
            task_id: format!("task-{}", target.name),
            recovered_vm_id: format!("vm-{}", target.name),
            restore_method: "instant-recovery".to_string(),
        })
    }
}
