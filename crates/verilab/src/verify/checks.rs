//! Built-in verification checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::warn;

use verilab_common::PowerState;

use crate::api::adapter::{EntityKind, ProtocolAdapter};
use crate::config::VerifyConfig;

use super::{CheckOutcome, RecoveredVm, VerificationCheck};

/// Rewrite a probe URL whose host is the literal `localhost` or `127.0.0.1`
/// to target the recovered VM's address instead. Checks configured against
/// the workload "itself" must land on the clone, not on this host.
pub fn rewrite_probe_url(url: &str, address: &str) -> String {
    for literal in ["localhost", "127.0.0.1"] {
        let needle = format!("://{}", literal);
        if let Some(pos) = url.find(&needle) {
            let after = pos + needle.len();
            let boundary = url[after..].chars().next();
            if matches!(boundary, None | Some(':') | Some('/') | Some('?')) {
                return format!("{}://{}{}", &url[..pos], address, &url[after..]);
            }
        }
    }
    url.to_string()
}

fn require_address(vm: &RecoveredVm) -> Result<String, CheckOutcome> {
    match &vm.address {
        Some(addr) => Ok(addr.clone()),
        None => Err(CheckOutcome::fail("no guest address discovered on the recovered VM")),
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Management-API heartbeat: the VM reports powered-on AND the guest agent
/// is up. An API error is a failed check, not a run error.
pub struct HeartbeatCheck {
    adapter: Arc<ProtocolAdapter>,
}

impl HeartbeatCheck {
    pub fn new(adapter: Arc<ProtocolAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl VerificationCheck for HeartbeatCheck {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        match self.adapter.get(EntityKind::Vm, &vm.vm_id).await {
            Ok(entity) => {
                let powered = entity.power_state == PowerState::On;
                let agent = entity.guest_agent_enabled;
                if powered && agent {
                    CheckOutcome::pass("powered on, guest agent responding")
                } else {
                    CheckOutcome::fail(format!(
                        "powered_on={} guest_agent={}",
                        powered, agent
                    ))
                }
            }
            Err(e) => CheckOutcome::fail(format!("heartbeat query failed: {}", e)),
        }
    }
}

// ============================================================================
// ICMP reachability
// ============================================================================

/// Pings the VM address with the system `ping` binary. Passes if at least
/// one of the configured attempts answers.
pub struct PingCheck {
    attempts: u32,
    timeout_secs: u64,
}

impl PingCheck {
    pub fn new(attempts: u32, timeout_secs: u64) -> Self {
        Self { attempts: attempts.max(1), timeout_secs }
    }
}

#[async_trait]
impl VerificationCheck for PingCheck {
    fn name(&self) -> &str {
        "ping"
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        let address = match require_address(vm) {
            Ok(a) => a,
            Err(outcome) => return outcome,
        };

        let mut succeeded = 0u32;
        let started = Instant::now();
        for _ in 0..self.attempts {
            let status = Command::new("ping")
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg(self.timeout_secs.to_string())
                .arg(&address)
                .output()
                .await;
            if matches!(status, Ok(out) if out.status.success()) {
                succeeded += 1;
            }
        }
        let elapsed = started.elapsed();

        let detail = format!(
            "{}/{} pings answered in {}ms",
            succeeded,
            self.attempts,
            elapsed.as_millis()
        );
        if succeeded > 0 {
            CheckOutcome::pass(detail)
        } else {
            CheckOutcome::fail(detail)
        }
    }
}

// ============================================================================
// TCP port
// ============================================================================

/// Connects to one TCP port on the VM address within a short timeout.
pub struct PortCheck {
    port: u16,
    timeout: Duration,
    name: String,
}

impl PortCheck {
    pub fn new(port: u16, timeout_secs: u64) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(timeout_secs),
            name: format!("tcp_port_{}", port),
        }
    }
}

#[async_trait]
impl VerificationCheck for PortCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        let address = match require_address(vm) {
            Ok(a) => a,
            Err(outcome) => return outcome,
        };
        let endpoint = format!("{}:{}", address, self.port);
        match timeout(self.timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(_)) => CheckOutcome::pass(format!("{} accepted the connection", endpoint)),
            Ok(Err(e)) => CheckOutcome::fail(format!("{}: {}", endpoint, e)),
            Err(_) => CheckOutcome::fail(format!(
                "{}: no answer within {}s",
                endpoint,
                self.timeout.as_secs()
            )),
        }
    }
}

// ============================================================================
// Reverse DNS
// ============================================================================

/// Reverse lookup of the VM address via `getent hosts`. Informational in
/// spirit but still produces a verdict: no PTR record is a fail.
pub struct DnsCheck;

#[async_trait]
impl VerificationCheck for DnsCheck {
    fn name(&self) -> &str {
        "reverse_dns"
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        let address = match require_address(vm) {
            Ok(a) => a,
            Err(outcome) => return outcome,
        };
        match Command::new("getent").arg("hosts").arg(&address).output().await {
            Ok(out) if out.status.success() => {
                let line = String::from_utf8_lossy(&out.stdout).lines().next().unwrap_or("").to_string();
                CheckOutcome::pass(format!("resolved: {}", line.trim()))
            }
            Ok(_) => CheckOutcome::fail(format!("no reverse record for {}", address)),
            Err(e) => CheckOutcome::fail(format!("lookup failed: {}", e)),
        }
    }
}

// ============================================================================
// HTTP endpoint
// ============================================================================

/// Probes one HTTP URL, rewriting a localhost host to the VM address first.
/// Any success-range status passes.
pub struct HttpCheck {
    url: String,
    client: reqwest::Client,
    name: String,
}

impl HttpCheck {
    /// Build the probe. TLS verification stays on unless `insecure_tls` was
    /// set explicitly.
    pub fn new(url: String, timeout_secs: u64, insecure_tls: bool) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs));
        if insecure_tls {
            warn!(
                "TLS certificate verification is DISABLED for HTTP probes (verify.insecure_tls = true)"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        let name = format!("http_{}", url);
        Ok(Self { url, client, name })
    }
}

#[async_trait]
impl VerificationCheck for HttpCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        let url = match &vm.address {
            Some(addr) => rewrite_probe_url(&self.url, addr),
            None if self.url.contains("localhost") || self.url.contains("127.0.0.1") => {
                return CheckOutcome::fail("no guest address to rewrite localhost URL to")
            }
            None => self.url.clone(),
        };
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                CheckOutcome::pass(format!("{} -> HTTP {}", url, resp.status().as_u16()))
            }
            Ok(resp) => CheckOutcome::fail(format!("{} -> HTTP {}", url, resp.status().as_u16())),
            Err(e) => CheckOutcome::fail(format!("{}: {}", url, e)),
        }
    }
}

// ============================================================================
// Custom script
// ============================================================================

/// Runs an operator-supplied script with the VM name and address as
/// arguments. Exit status decides; a missing or unrunnable script fails.
pub struct ScriptCheck {
    path: PathBuf,
    timeout: Duration,
}

impl ScriptCheck {
    pub fn new(path: PathBuf, timeout_secs: u64) -> Self {
        Self { path, timeout: Duration::from_secs(timeout_secs) }
    }
}

#[async_trait]
impl VerificationCheck for ScriptCheck {
    fn name(&self) -> &str {
        "script"
    }

    async fn run(&self, vm: &RecoveredVm) -> CheckOutcome {
        if !self.path.exists() {
            return CheckOutcome::fail(format!("script {} does not exist", self.path.display()));
        }
        let address = vm.address.clone().unwrap_or_default();
        // kill_on_drop: a timed-out script must not keep running after the
        // check has already reported failure.
        let result = timeout(
            self.timeout,
            Command::new(&self.path).arg(&vm.name).arg(&address).kill_on_drop(true).output(),
        )
        .await;
        match result {
            Ok(Ok(out)) if out.status.success() => CheckOutcome::pass("script exited 0"),
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                CheckOutcome::fail(format!(
                    "script exited {}: {}",
                    out.status.code().unwrap_or(-1),
                    stderr.trim()
                ))
            }
            Ok(Err(e)) => CheckOutcome::fail(format!("script failed to start: {}", e)),
            Err(_) => CheckOutcome::fail(format!(
                "script still running after {}s",
                self.timeout.as_secs()
            )),
        }
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Build the check list the config asks for, in a stable order.
pub fn build_checks(
    config: &VerifyConfig,
    adapter: Arc<ProtocolAdapter>,
) -> anyhow::Result<Vec<Box<dyn VerificationCheck>>> {
    let mut checks: Vec<Box<dyn VerificationCheck>> = Vec::new();

    if config.heartbeat {
        checks.push(Box::new(HeartbeatCheck::new(adapter)));
    }
    if config.ping_attempts > 0 {
        checks.push(Box::new(PingCheck::new(config.ping_attempts, config.ping_timeout_secs)));
    }
    for port in &config.tcp_ports {
        checks.push(Box::new(PortCheck::new(*port, config.port_timeout_secs)));
    }
    if config.check_dns {
        checks.push(Box::new(DnsCheck));
    }
    for url in &config.http_urls {
        checks.push(Box::new(HttpCheck::new(
            url.clone(),
            config.http_timeout_secs,
            config.insecure_tls,
        )?));
    }
    if let Some(path) = &config.script_path {
        checks.push(Box::new(ScriptCheck::new(path.clone(), config.script_timeout_secs)));
    }

    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rewrite_localhost_variants() {
        assert_eq!(
            rewrite_probe_url("http://localhost:8080/health", "10.0.0.5"),
            "http://10.0.0.5:8080/health"
        );
        assert_eq!(
            rewrite_probe_url("https://127.0.0.1/status", "10.0.0.5"),
            "https://10.0.0.5/status"
        );
        assert_eq!(rewrite_probe_url("http://localhost", "10.0.0.5"), "http://10.0.0.5");
    }

    #[test]
    fn test_rewrite_leaves_real_hosts_alone() {
        assert_eq!(
            rewrite_probe_url("http://db01.lab.local:5432/", "10.0.0.5"),
            "http://db01.lab.local:5432/"
        );
        // A host that merely starts with the literal is not rewritten.
        assert_eq!(
            rewrite_probe_url("http://localhost.example.com/x", "10.0.0.5"),
            "http://localhost.example.com/x"
        );
    }

    fn vm_without_address() -> RecoveredVm {
        RecoveredVm { name: "db01-verify".into(), vm_id: "vm-1".into(), address: None }
    }

    fn vm_at(address: &str) -> RecoveredVm {
        RecoveredVm {
            name: "db01-verify".into(),
            vm_id: "vm-1".into(),
            address: Some(address.to_string()),
        }
    }

    #[tokio::test]
    async fn test_ping_without_address_fails() {
        let outcome = PingCheck::new(2, 1).run(&vm_without_address()).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("no guest address"));
    }

    #[tokio::test]
    async fn test_port_check_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = PortCheck::new(port, 2).run(&vm_at("127.0.0.1")).await;
        assert!(outcome.passed, "{}", outcome.detail);
    }

    #[tokio::test]
    async fn test_port_check_refused_fails() {
        // Bind then drop so nothing listens on the port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = PortCheck::new(port, 2).run(&vm_at("127.0.0.1")).await;
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn test_script_check_missing_path_fails() {
        let check = ScriptCheck::new(PathBuf::from("/nonexistent/verify.sh"), 5);
        let outcome = check.run(&vm_at("10.0.0.5")).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_check_exit_status_decides() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ok_path = dir.path().join("ok.sh");
        let mut f = std::fs::File::create(&ok_path).unwrap();
        writeln!(f, "#!/bin/sh\nexit 0").unwrap();
        std::fs::set_permissions(&ok_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        drop(f);

        let fail_path = dir.path().join("fail.sh");
        let mut f = std::fs::File::create(&fail_path).unwrap();
        writeln!(f, "#!/bin/sh\necho broken >&2\nexit 3").unwrap();
        std::fs::set_permissions(&fail_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        drop(f);

        let vm = vm_at("10.0.0.5");
        assert!(ScriptCheck::new(ok_path, 5).run(&vm).await.passed);
        let outcome = ScriptCheck::new(fail_path, 5).run(&vm).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_script_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-ran");
        let slow_path = dir.path().join("slow.sh");
        let mut f = std::fs::File::create(&slow_path).unwrap();
        writeln!(f, "#!/bin/sh\nsleep 2\ntouch {}", marker.display()).unwrap();
        std::fs::set_permissions(&slow_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        drop(f);

        let outcome = ScriptCheck::new(slow_path, 1).run(&vm_at("10.0.0.5")).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("still running"));

        // Past the point the script would have finished on its own.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "script outlived its timeout");
    }

    #[test]
    fn test_build_checks_follows_config() {
        use crate::api::context::ApiGeneration;
        use crate::api::retry::RetryPolicy;
        use crate::api::transport::{ApiClient, FakeTransport};

        let fake = Arc::new(FakeTransport::new());
        let adapter = Arc::new(ProtocolAdapter::new(
            ApiClient::new(fake, RetryPolicy::default()),
            ApiGeneration::V4,
        ));

        let mut config = VerifyConfig::default();
        config.tcp_ports = vec![22, 443];
        config.check_dns = true;
        let checks = build_checks(&config, adapter).unwrap();
        let names: Vec<&str> = checks.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["heartbeat", "ping", "tcp_port_22", "tcp_port_443", "reverse_dns"]);
    }
}
