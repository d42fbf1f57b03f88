//! Bootstrapper (spec.md §6 "Process surface"): start-up sequence for the
//! confidential-computing credential worker. Wires MemoryGuard, Attestation,
//! the sqlite repository, vault, connector registry, aggregator, rate
//! limiter and scheduler together, then serves the mTLS RPC surface until a
//! signal asks it to stop.
//!
//! Grounded on the teacher's `src/bin/edge_receiver.rs` start-up shape
//! (clap `Parser` CLI, `tracing_subscriber` init, spawn a background task,
//! signal-driven shutdown) — generalized here to a 30-second graceful
//! shutdown deadline and the distinct process exit codes spec.md §6 names.

use anyhow::Context;
use clap::Parser;
use sevworker_core::aggregator::SnapshotAggregator;
use sevworker_core::attestation::{Attestation, EndorsementKeyStore, PlatformReportSource};
use sevworker_core::config::Config;
use sevworker_core::connector::registry::ConnectorRegistry;
use sevworker_core::memory_guard::MemoryGuard;
use sevworker_core::rate_limiter::RateLimiter;
use sevworker_core::redact::RedactingLayer;
use sevworker_core::repository::sqlite::SqliteRepository;
use sevworker_core::repository::{ConnectionRepository, RateLimitRepository, SnapshotRepository, SyncStatusRepository, UserPreferencesRepository};
use sevworker_core::rpc::handlers::RpcHandlers;
use sevworker_core::rpc::server::{self, TlsPaths};
use sevworker_core::scheduler::Scheduler;
use sevworker_core::vault::{CredentialVault, MasterKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Startup or attestation failure — spec.md §6.
const EXIT_STARTUP_FAILURE: i32 = 1;
/// Graceful shutdown exceeded its 30-second deadline — spec.md §5, §6.
const EXIT_SHUTDOWN_TIMEOUT: i32 = 3;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "sevworker")]
#[command(about = "Confidential-computing credential-sync worker")]
struct Cli {
    /// Path to a dotenv-style config file, loaded before the usual
    /// cwd/CARGO_MANIFEST_DIR/parent search `Config::from_env` performs.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Force ATTESTATION_MODE=development regardless of the environment.
    /// Intended for local runs against a host with no SEV-SNP device.
    #[arg(long)]
    dev_mode: bool,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sevworker_core={log_level},tower_http=info")));
    tracing_subscriber::registry().with(filter).with(RedactingLayer::stdout()).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        dotenv::from_path(path).with_context(|| format!("failed to load config file {path:?}"))?;
    }
    if cli.dev_mode {
        std::env::set_var("ATTESTATION_MODE", "development");
    }

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup failed: {e:#}");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    init_tracing(&config.log_level);
    info!(rpc_port = config.rpc_port, attestation_mode = ?config.attestation_mode, "sevworker starting");
    if config.metrics_enabled {
        info!("METRICS_ENABLED is set; the Prometheus exporter is deployed as a separate sidecar, not this binary");
    }

    let memory_guard = Arc::new(MemoryGuard::install());

    let attestation = Arc::new(Attestation::new(
        config.attestation_mode,
        Box::new(PlatformReportSource::new()),
        EndorsementKeyStore::new(config.amd_vcek_cache_path.clone()),
    ));
    if let Err(e) = attestation.gate_startup().await {
        error!(error = %e, "attestation gate refused startup");
        std::process::exit(EXIT_STARTUP_FAILURE);
    }

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(error = %e, "failed to create data directory");
        std::process::exit(EXIT_STARTUP_FAILURE);
    }

    let repo = match SqliteRepository::open(config.db_path()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to open sqlite repository");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    let connections: Arc<dyn ConnectionRepository> = repo.clone();
    let snapshots: Arc<dyn SnapshotRepository> = repo.clone();
    let sync_status: Arc<dyn SyncStatusRepository> = repo.clone();
    let rate_limit_repo: Arc<dyn RateLimitRepository> = repo.clone();
    let preferences: Arc<dyn UserPreferencesRepository> = repo.clone();

    let master_key = MasterKey::derive(&config.master_key_secret);
    let vault = Arc::new(CredentialVault::new(master_key, connections.clone()));
    let registry = Arc::new(ConnectorRegistry::new());
    let aggregator = Arc::new(SnapshotAggregator::new(
        vault.clone(),
        registry.clone(),
        connections.clone(),
        snapshots.clone(),
        sync_status.clone(),
        preferences,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(rate_limit_repo));
    let scheduler = Arc::new(Scheduler::new(aggregator.clone(), connections.clone(), rate_limiter.clone()));

    let tls_paths = TlsPaths {
        ca_cert: config.tls_ca_cert.as_deref(),
        server_cert: &config.tls_server_cert,
        server_key: &config.tls_server_key,
        require_client_cert: config.require_client_cert,
    };
    let tls_config = match server::build_tls_config(&tls_paths).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build TLS server config; refusing to bind");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    let handlers = Arc::new(RpcHandlers {
        vault,
        aggregator,
        rate_limiter,
        connections,
        snapshots,
        attestation,
        started_at: Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config.rpc_port).into();
    let server_handle = axum_server::Handle::new();
    let rpc_task = {
        let handle = server_handle.clone();
        tokio::spawn(async move { server::serve(addr, tls_config, handlers, handle).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, beginning graceful shutdown");

    shutdown_tx.send(true).ok();
    server_handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));
    memory_guard.wipe_all();

    let shutdown = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        let _ = scheduler_task.await;
        let _ = rpc_task.await;
    })
    .await;

    match shutdown {
        Ok(()) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(_) => {
            warn!("graceful shutdown exceeded the 30-second deadline, forcing exit");
            std::process::exit(EXIT_SHUTDOWN_TIMEOUT);
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
