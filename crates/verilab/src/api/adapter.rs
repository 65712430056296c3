//! Protocol adapter: one logical interface over two incompatible API
//! generations.
//!
//! V4 paginates with `$page`/`$limit` on GET and guards mutations with ETag
//! concurrency tokens plus idempotency keys. V3 paginates with
//! length/offset on POST `/list` and versions resources through a counter
//! in the body. Raw per-generation responses are normalized into one
//! canonical `Entity` shape; nothing above this module sees wire payloads.

use serde_json::{json, Value};
use tracing::debug;

use verilab_common::{ApiError, PowerState};

use super::context::{ApiGeneration, RequestContext};
use super::transport::{ApiClient, ApiRequest};

/// Entities the orchestrator operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Vm,
    Subnet,
    Cluster,
    Task,
}

impl EntityKind {
    /// URL path segment; shared by both generations.
    fn segment(&self) -> &'static str {
        match self {
            EntityKind::Vm => "vms",
            EntityKind::Subnet => "subnets",
            EntityKind::Cluster => "clusters",
            EntityKind::Task => "tasks",
        }
    }

    /// The `kind` discriminator V3 list bodies carry.
    fn v3_kind(&self) -> &'static str {
        match self {
            EntityKind::Vm => "vm",
            EntityKind::Subnet => "subnet",
            EntityKind::Cluster => "cluster",
            EntityKind::Task => "task",
        }
    }
}

/// Version marker on a canonical entity, per source generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityVersion {
    /// V4 ETag, echoed back as If-Match on mutation.
    Tag(String),
    /// V3 in-body version counter, merged into mutation bodies.
    Counter(i64),
    None,
}

/// Canonical entity shape. Fields that do not apply to a kind stay empty.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub power_state: PowerState,
    pub guest_agent_enabled: bool,
    /// Network ids of the entity's NICs (VMs only).
    pub nic_network_ids: Vec<String>,
    /// Guest addresses discovered on the NICs (VMs only).
    pub addresses: Vec<String>,
    pub vlan_tag: Option<u32>,
    pub cluster_id: Option<String>,
    pub subnet_kind: Option<String>,
    pub version: EntityVersion,
    /// Normalized-from payload, kept for diagnostics.
    pub payload: Value,
}

/// Terminal and non-terminal states of an async server-side task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub handle: String,
    pub state: TaskState,
    pub detail: Option<String>,
}

const PAGE_SIZE: usize = 50;

pub struct ProtocolAdapter {
    client: ApiClient,
    generation: ApiGeneration,
}

impl ProtocolAdapter {
    pub fn new(client: ApiClient, generation: ApiGeneration) -> Self {
        Self { client, generation }
    }

    pub fn generation(&self) -> ApiGeneration {
        self.generation
    }

    fn base_path(&self, kind: EntityKind) -> String {
        match self.generation {
            ApiGeneration::V3 => format!("/api/v3/{}", kind.segment()),
            ApiGeneration::V4 => format!("/api/v4/{}", kind.segment()),
        }
    }

    /// List entities of a kind, optionally filtered by exact name. Pages are
    /// fetched until the running count reaches the server-reported total and
    /// returned as one flattened, ordered sequence.
    pub async fn list(
        &self,
        kind: EntityKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<Entity>, ApiError> {
        match self.generation {
            ApiGeneration::V4 => self.list_v4(kind, name_filter).await,
            ApiGeneration::V3 => self.list_v3(kind, name_filter).await,
        }
    }

    async fn list_v4(
        &self,
        kind: EntityKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<Entity>, ApiError> {
        let mut entities = Vec::new();
        let mut page = 0usize;
        loop {
            let ctx = RequestContext::new(self.generation);
            let mut req = ApiRequest::get(self.base_path(kind))
                .with_query("$page", page.to_string())
                .with_query("$limit", PAGE_SIZE.to_string());
            if let Some(name) = name_filter {
                req = req.with_query("$filter", format!("name eq '{}'", name));
            }
            let resp = self.client.call(&ctx, &req).await?;

            let data = resp
                .body
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| ApiError::Malformed("v4 list response missing data array".into()))?;
            let total = resp
                .body
                .get("metadata")
                .and_then(|m| m.get("totalAvailableResults"))
                .and_then(|t| t.as_u64())
                .unwrap_or(data.len() as u64) as usize;

            let fetched = data.len();
            for raw in data {
                entities.push(normalize_v4(kind, raw, None)?);
            }
            debug!(
                "[{}] v4 list {}: page {} fetched {} ({}/{})",
                ctx.correlation_id,
                kind.segment(),
                page,
                fetched,
                entities.len(),
                total
            );

            // Stop on reported total; empty pages guard a misreported count.
            if entities.len() >= total || fetched == 0 {
                return Ok(entities);
            }
            page += 1;
        }
    }

    async fn list_v3(
        &self,
        kind: EntityKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<Entity>, ApiError> {
        let mut entities = Vec::new();
        let mut offset = 0usize;
        loop {
            let ctx = RequestContext::new(self.generation);
            let mut body = json!({
                "kind": kind.v3_kind(),
                "length": PAGE_SIZE,
                "offset": offset,
            });
            if let Some(name) = name_filter {
                body["filter"] = json!(format!("name=={}", name));
            }
            let req = ApiRequest::post(format!("{}/list", self.base_path(kind)), body);
            let resp = self.client.call(&ctx, &req).await?;

            let page = resp
                .body
                .get("entities")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    ApiError::Malformed("v3 list response missing entities array".into())
                })?;
            let total = resp
                .body
                .get("metadata")
                .and_then(|m| m.get("total_matches"))
                .and_then(|t| t.as_u64())
                .unwrap_or(page.len() as u64) as usize;

            let fetched = page.len();
            for raw in page {
                entities.push(normalize_v3(kind, raw)?);
            }
            debug!(
                "[{}] v3 list {}: offset {} fetched {} ({}/{})",
                ctx.correlation_id,
                kind.segment(),
                offset,
                fetched,
                entities.len(),
                total
            );

            if entities.len() >= total || fetched == 0 {
                return Ok(entities);
            }
            offset += fetched;
        }
    }

    /// Fetch one entity by id.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, ApiError> {
        let ctx = RequestContext::new(self.generation);
        let req = ApiRequest::get(format!("{}/{}", self.base_path(kind), id));
        let resp = self.client.call(&ctx, &req).await?;
        match self.generation {
            ApiGeneration::V4 => {
                let raw = resp
                    .body
                    .get("data")
                    .ok_or_else(|| ApiError::Malformed("v4 get response missing data".into()))?;
                normalize_v4(kind, raw, resp.etag)
            }
            ApiGeneration::V3 => normalize_v3(kind, &resp.body),
        }
    }

    /// Create (`id` = None) or update (`id` = Some) an entity. One call is
    /// one logical attempt: V4 gets a fresh idempotency key here, and for
    /// updates a fresh concurrency token is fetched immediately beforehand.
    /// Returns the raw mutation response (usually a task reference).
    pub async fn mutate(
        &self,
        kind: EntityKind,
        id: Option<&str>,
        body: Value,
    ) -> Result<Value, ApiError> {
        match self.generation {
            ApiGeneration::V4 => self.mutate_v4(kind, id, body).await,
            ApiGeneration::V3 => self.mutate_v3(kind, id, body).await,
        }
    }

    async fn mutate_v4(
        &self,
        kind: EntityKind,
        id: Option<&str>,
        body: Value,
    ) -> Result<Value, ApiError> {
        let mut ctx = RequestContext::new(self.generation).with_idempotency_key();
        let req = match id {
            Some(id) => {
                // The server rejects conditional mutations without a token,
                // so every update is a fetch-then-mutate round trip.
                let current = self.get(kind, id).await?;
                if let EntityVersion::Tag(tag) = current.version {
                    ctx = ctx.with_concurrency_token(tag);
                } else {
                    return Err(ApiError::Malformed(format!(
                        "v4 {} {} returned no concurrency token",
                        kind.segment(),
                        id
                    )));
                }
                ApiRequest::put(format!("{}/{}", self.base_path(kind), id), body)
            }
            None => ApiRequest::post(self.base_path(kind), body),
        };
        let resp = self.client.call(&ctx, &req).await?;
        Ok(resp.body)
    }

    async fn mutate_v3(
        &self,
        kind: EntityKind,
        id: Option<&str>,
        mut body: Value,
    ) -> Result<Value, ApiError> {
        let ctx = RequestContext::new(self.generation);
        let req = match id {
            Some(id) => {
                // V3 carries its version counter inside the body.
                let current = self.get(kind, id).await?;
                if let EntityVersion::Counter(version) = current.version {
                    body["metadata"]["spec_version"] = json!(version);
                }
                ApiRequest::put(format!("{}/{}", self.base_path(kind), id), body)
            }
            None => ApiRequest::post(self.base_path(kind), body),
        };
        let resp = self.client.call(&ctx, &req).await?;
        Ok(resp.body)
    }

    /// Delete an entity. V4 deletes are conditional and idempotency-keyed
    /// like any other mutation.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}", self.base_path(kind), id);
        match self.generation {
            ApiGeneration::V4 => {
                let mut ctx = RequestContext::new(self.generation).with_idempotency_key();
                let current = self.get(kind, id).await?;
                if let EntityVersion::Tag(tag) = current.version {
                    ctx = ctx.with_concurrency_token(tag);
                }
                self.client.call(&ctx, &ApiRequest::delete(path)).await?;
            }
            ApiGeneration::V3 => {
                let ctx = RequestContext::new(self.generation);
                self.client.call(&ctx, &ApiRequest::delete(path)).await?;
            }
        }
        Ok(())
    }

    /// Fetch the status of an async server-side task.
    pub async fn get_task(&self, handle: &str) -> Result<TaskStatus, ApiError> {
        let ctx = RequestContext::new(self.generation);
        let req = ApiRequest::get(format!("{}/{}", self.base_path(EntityKind::Task), handle));
        let resp = self.client.call(&ctx, &req).await?;

        let (raw_state, detail) = match self.generation {
            ApiGeneration::V4 => {
                let data = resp
                    .body
                    .get("data")
                    .ok_or_else(|| ApiError::Malformed("v4 task response missing data".into()))?;
                (
                    data.get("status").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                    data.get("errorMessage").and_then(|e| e.as_str()).map(String::from),
                )
            }
            ApiGeneration::V3 => (
                resp.body.get("status").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                resp.body.get("error_detail").and_then(|e| e.as_str()).map(String::from),
            ),
        };

        let state = match raw_state.to_ascii_uppercase().as_str() {
            "SUCCEEDED" | "COMPLETED" => TaskState::Succeeded,
            "FAILED" | "ABORTED" => TaskState::Failed,
            _ => TaskState::Running,
        };
        Ok(TaskStatus { handle: handle.to_string(), state, detail })
    }
}

// ============================================================================
// Normalization
// ============================================================================

fn normalize_v4(kind: EntityKind, raw: &Value, etag: Option<String>) -> Result<Entity, ApiError> {
    let id = raw
        .get("extId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::Malformed(format!("v4 {} entity missing extId", kind.segment())))?
        .to_string();
    let name = raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let power_state = match raw.get("powerState").and_then(|v| v.as_str()) {
        Some("ON") => PowerState::On,
        Some("OFF") => PowerState::Off,
        _ => PowerState::Unknown,
    };
    let guest_agent_enabled = raw
        .pointer("/guestTools/enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut nic_network_ids = Vec::new();
    let mut addresses = Vec::new();
    if let Some(nics) = raw.get("nics").and_then(|v| v.as_array()) {
        for nic in nics {
            if let Some(subnet) = nic.get("subnetExtId").and_then(|v| v.as_str()) {
                nic_network_ids.push(subnet.to_string());
            }
            if let Some(ip) = nic.get("ipAddress").and_then(|v| v.as_str()) {
                addresses.push(ip.to_string());
            }
        }
    }

    Ok(Entity {
        id,
        name,
        kind,
        power_state,
        guest_agent_enabled,
        nic_network_ids,
        addresses,
        vlan_tag: raw.get("vlanId").and_then(|v| v.as_u64()).map(|v| v as u32),
        cluster_id: raw.get("clusterExtId").and_then(|v| v.as_str()).map(String::from),
        subnet_kind: raw.get("subnetType").and_then(|v| v.as_str()).map(String::from),
        version: etag.map(EntityVersion::Tag).unwrap_or(EntityVersion::None),
        payload: raw.clone(),
    })
}

fn normalize_v3(kind: EntityKind, raw: &Value) -> Result<Entity, ApiError> {
    let id = raw
        .pointer("/metadata/uuid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ApiError::Malformed(format!("v3 {} entity missing metadata.uuid", kind.segment()))
        })?
        .to_string();
    let name = raw
        .pointer("/spec/name")
        .or_else(|| raw.pointer("/status/name"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let power_state = match raw.pointer("/status/resources/power_state").and_then(|v| v.as_str()) {
        Some("ON") => PowerState::On,
        Some("OFF") => PowerState::Off,
        _ => PowerState::Unknown,
    };
    let guest_agent_enabled = raw
        .pointer("/status/resources/guest_tools/state")
        .and_then(|v| v.as_str())
        .map(|s| s == "ENABLED")
        .unwrap_or(false);

    let mut nic_network_ids = Vec::new();
    let mut addresses = Vec::new();
    if let Some(nics) = raw.pointer("/status/resources/nic_list").and_then(|v| v.as_array()) {
        for nic in nics {
            if let Some(subnet) = nic.pointer("/subnet_reference/uuid").and_then(|v| v.as_str()) {
                nic_network_ids.push(subnet.to_string());
            }
            if let Some(endpoints) = nic.get("ip_endpoint_list").and_then(|v| v.as_array()) {
                for ep in endpoints {
                    if let Some(ip) = ep.get("ip").and_then(|v| v.as_str()) {
                        addresses.push(ip.to_string());
                    }
                }
            }
        }
    }

    let version = raw
        .pointer("/metadata/spec_version")
        .and_then(|v| v.as_i64())
        .map(EntityVersion::Counter)
        .unwrap_or(EntityVersion::None);

    Ok(Entity {
        id,
        name,
        kind,
        power_state,
        guest_agent_enabled,
        nic_network_ids,
        addresses,
        vlan_tag: raw
            .pointer("/status/resources/vlan_id")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        cluster_id: raw
            .pointer("/spec/cluster_reference/uuid")
            .and_then(|v| v.as_str())
            .map(String::from),
        subnet_kind: raw
            .pointer("/status/resources/subnet_type")
            .and_then(|v| v.as_str())
            .map(String::from),
        version,
        payload: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::retry::RetryPolicy;
    use crate::api::transport::{ApiResponse, FakeTransport, Method};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter_over(fake: Arc<FakeTransport>, generation: ApiGeneration) -> ProtocolAdapter {
        let policy = RetryPolicy::new(1).unwrap().with_base(Duration::from_millis(1));
        ProtocolAdapter::new(ApiClient::new(fake, policy), generation)
    }

    fn v4_vm(id: &str, name: &str) -> Value {
        json!({
            "extId": id,
            "name": name,
            "powerState": "ON",
            "guestTools": {"enabled": true},
            "nics": [{"subnetExtId": "net-1", "ipAddress": "10.0.1.50"}],
        })
    }

    fn v3_vm(id: &str, name: &str) -> Value {
        json!({
            "metadata": {"uuid": id, "spec_version": 7},
            "spec": {"name": name},
            "status": {"resources": {
                "power_state": "ON",
                "guest_tools": {"state": "ENABLED"},
                "nic_list": [{
                    "subnet_reference": {"uuid": "net-1"},
                    "ip_endpoint_list": [{"ip": "10.0.1.50"}],
                }],
            }},
        })
    }

    #[tokio::test]
    async fn test_v4_pagination_flattens_all_pages() {
        let fake = Arc::new(FakeTransport::new());
        // 5 entities over 3 pages of 2.
        fake.push(Ok(ApiResponse::ok(json!({
            "data": [v4_vm("a", "vm-a"), v4_vm("b", "vm-b")],
            "metadata": {"totalAvailableResults": 5},
        }))));
        fake.push(Ok(ApiResponse::ok(json!({
            "data": [v4_vm("c", "vm-c"), v4_vm("d", "vm-d")],
            "metadata": {"totalAvailableResults": 5},
        }))));
        fake.push(Ok(ApiResponse::ok(json!({
            "data": [v4_vm("e", "vm-e")],
            "metadata": {"totalAvailableResults": 5},
        }))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V4);
        let vms = adapter.list(EntityKind::Vm, None).await.unwrap();

        let ids: Vec<&str> = vms.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d", "e"]);
        assert_eq!(fake.call_count(), 3);

        // Query pagination, ascending pages.
        let calls = fake.calls();
        assert!(calls[0].query.contains(&("$page".to_string(), "0".to_string())));
        assert!(calls[2].query.contains(&("$page".to_string(), "2".to_string())));
    }

    #[tokio::test]
    async fn test_v3_pagination_advances_offset() {
        let fake = Arc::new(FakeTransport::new());
        fake.push(Ok(ApiResponse::ok(json!({
            "entities": [v3_vm("a", "vm-a"), v3_vm("b", "vm-b")],
            "metadata": {"total_matches": 3},
        }))));
        fake.push(Ok(ApiResponse::ok(json!({
            "entities": [v3_vm("c", "vm-c")],
            "metadata": {"total_matches": 3},
        }))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V3);
        let vms = adapter.list(EntityKind::Vm, None).await.unwrap();

        assert_eq!(vms.len(), 3);
        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, "POST");
        assert!(calls[0].path.ends_with("/vms/list"));
        assert_eq!(calls[0].body.as_ref().unwrap()["offset"], json!(0));
        assert_eq!(calls[1].body.as_ref().unwrap()["offset"], json!(2));
    }

    #[tokio::test]
    async fn test_v4_empty_page_guards_misreported_total() {
        let fake = Arc::new(FakeTransport::new());
        fake.push(Ok(ApiResponse::ok(json!({
            "data": [v4_vm("a", "vm-a")],
            "metadata": {"totalAvailableResults": 10},
        }))));
        fake.push(Ok(ApiResponse::ok(json!({
            "data": [],
            "metadata": {"totalAvailableResults": 10},
        }))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V4);
        let vms = adapter.list(EntityKind::Vm, None).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(fake.call_count(), 2);
    }

    #[tokio::test]
    async fn test_v4_get_captures_etag() {
        let fake = Arc::new(FakeTransport::new());
        fake.push(Ok(ApiResponse::ok_with_etag(json!({"data": v4_vm("a", "vm-a")}), "W/\"42\"")));

        let adapter = adapter_over(fake, ApiGeneration::V4);
        let vm = adapter.get(EntityKind::Vm, "a").await.unwrap();
        assert_eq!(vm.version, EntityVersion::Tag("W/\"42\"".to_string()));
        assert_eq!(vm.power_state, PowerState::On);
        assert!(vm.guest_agent_enabled);
        assert_eq!(vm.addresses, ["10.0.1.50"]);
    }

    #[tokio::test]
    async fn test_v4_update_is_fetch_then_mutate_with_token_and_key() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(
            Method::Get,
            "/vms/a",
            Ok(ApiResponse::ok_with_etag(json!({"data": v4_vm("a", "vm-a")}), "etag-7")),
        );
        fake.route(Method::Put, "/vms/a", Ok(ApiResponse::ok(json!({"data": {"extId": "task-1"}}))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V4);
        adapter
            .mutate(EntityKind::Vm, Some("a"), json!({"powerState": "ON"}))
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[1].method, "PUT");
        assert_eq!(calls[1].if_match.as_deref(), Some("etag-7"));
        assert!(calls[1].idempotency_key.is_some());
    }

    #[tokio::test]
    async fn test_v4_distinct_mutations_mint_distinct_keys() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(
            Method::Get,
            "/vms/a",
            Ok(ApiResponse::ok_with_etag(json!({"data": v4_vm("a", "vm-a")}), "etag-7")),
        );
        fake.route(Method::Put, "/vms/a", Ok(ApiResponse::ok(json!({"data": {}}))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V4);
        adapter.mutate(EntityKind::Vm, Some("a"), json!({})).await.unwrap();
        adapter.mutate(EntityKind::Vm, Some("a"), json!({})).await.unwrap();

        let puts = fake.calls_matching(Some(Method::Put), "/vms/a");
        assert_eq!(puts.len(), 2);
        assert_ne!(puts[0].idempotency_key, puts[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_v3_update_merges_version_counter() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(Method::Get, "/vms/a", Ok(ApiResponse::ok(v3_vm("a", "vm-a"))));
        fake.route(Method::Put, "/vms/a", Ok(ApiResponse::ok(json!({"status": {}}))));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V3);
        adapter
            .mutate(EntityKind::Vm, Some("a"), json!({"spec": {"name": "vm-a"}}))
            .await
            .unwrap();

        let puts = fake.calls_matching(Some(Method::Put), "/vms/a");
        assert_eq!(puts[0].body.as_ref().unwrap()["metadata"]["spec_version"], json!(7));
        // No separate token or dedup key in V3.
        assert!(puts[0].if_match.is_none());
        assert!(puts[0].idempotency_key.is_none());
    }

    #[tokio::test]
    async fn test_v4_delete_fetches_fresh_token() {
        let fake = Arc::new(FakeTransport::new());
        fake.route(
            Method::Get,
            "/vms/a",
            Ok(ApiResponse::ok_with_etag(json!({"data": v4_vm("a", "vm-a")}), "etag-9")),
        );
        fake.route(Method::Delete, "/vms/a", Ok(ApiResponse { status: 204, body: Value::Null, etag: None }));

        let adapter = adapter_over(fake.clone(), ApiGeneration::V4);
        adapter.delete(EntityKind::Vm, "a").await.unwrap();

        let deletes = fake.calls_matching(Some(Method::Delete), "/vms/a");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].if_match.as_deref(), Some("etag-9"));
        assert!(deletes[0].idempotency_key.is_some());
    }

    #[tokio::test]
    async fn test_task_state_normalization() {
        let fake = Arc::new(FakeTransport::new());
        fake.push(Ok(ApiResponse::ok(json!({
            "data": {"extId": "t1", "status": "FAILED", "errorMessage": "disk full"},
        }))));
        let adapter = adapter_over(fake, ApiGeneration::V4);
        let task = adapter.get_task("t1").await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.detail.as_deref(), Some("disk full"));

        let fake = Arc::new(FakeTransport::new());
        fake.push(Ok(ApiResponse::ok(json!({"uuid": "t2", "status": "SUCCEEDED"}))));
        let adapter = adapter_over(fake, ApiGeneration::V3);
        let task = adapter.get_task("t2").await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
    }

    #[test]
    fn test_normalization_rejects_missing_id() {
        assert!(normalize_v4(EntityKind::Vm, &json!({"name": "x"}), None).is_err());
        assert!(normalize_v3(EntityKind::Vm, &json!({"spec": {"name": "x"}})).is_err());
    }
}
