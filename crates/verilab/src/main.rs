//! verilab - recovery verification for backup restore points
//!
//! Restores workloads onto an isolated network, boots them in tier order,
//! runs verification checks, and tears everything down again.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use verilab::api::{ApiClient, Auth, HttpTransport, ProtocolAdapter, RetryPolicy};
use verilab::catalog::HttpCatalog;
use verilab::config::Config;
use verilab::run::run_verification_job;

#[derive(Parser)]
#[command(name = "verilab", version, about = "Verify that backups actually restore and boot")]
struct Cli {
    /// Config file path; falls back to the standard locations
    #[arg(long)]
    config: Option<String>,

    /// Walk the full plan without restoring, powering on or deleting
    #[arg(long)]
    dry_run: bool,

    /// Only verify these targets (comma-separated names)
    #[arg(long, value_delimiter = ',')]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("verilab v{} starting", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("loading config from {}", path))?,
        None => Config::load(),
    };

    if !cli.targets.is_empty() {
        config.targets.retain(|t| cli.targets.contains(&t.name));
        anyhow::ensure!(
            !config.targets.is_empty(),
            "none of the requested targets appear in the config"
        );
    }

    let auth = if let Some(token) = &config.api.bearer_token {
        Auth::Bearer { token: token.clone() }
    } else if let (Some(username), Some(password)) = (&config.api.username, &config.api.password) {
        Auth::Basic { username: username.clone(), password: password.clone() }
    } else {
        Auth::None
    };

    let transport = HttpTransport::new(
        &config.api.base_url,
        auth,
        config.api.timeout_secs,
        config.api.insecure_tls,
    )?;
    let policy = RetryPolicy::new(config.api.retry_count)?;
    let adapter = Arc::new(ProtocolAdapter::new(
        ApiClient::new(Arc::new(transport), policy),
        config.api.generation,
    ));

    let catalog = Arc::new(HttpCatalog::new(
        &config.catalog.base_url,
        config.catalog.api_key.clone(),
        config.catalog.timeout_secs,
    )?);

    let report = run_verification_job(&config, adapter, catalog, cli.dry_run).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    std::process::exit(if report.success { 0 } else { 1 });
}
