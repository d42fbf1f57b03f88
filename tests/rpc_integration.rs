//! End-to-end tests against the RPC surface, wired to a real on-disk
//! sqlite repository (spec.md's test-tooling guidance: "tests/ integration
//! tests exercising the RPC surface... against fake connectors"). No
//! outbound network call is ever made here: every scenario either fails
//! before a Connector would be constructed (no connection on file, bad
//! input) or drives the repository directly, the same way the teacher's
//! own `tests/backtest_run_integration.rs` exercises its orchestrator
//! through a fixture database rather than live data sources.

use chrono::Utc;
use sevworker_core::aggregator::SnapshotAggregator;
use sevworker_core::attestation::{Attestation, AttestationMode, EndorsementKeyStore, ReportSourceClient};
use sevworker_core::attestation::report::Report;
use sevworker_core::connector::registry::ConnectorRegistry;
use sevworker_core::error::{AppError, AppResult};
use sevworker_core::models::{Market, MarketMetrics, Snapshot, VenueId};
use sevworker_core::rate_limiter::RateLimiter;
use sevworker_core::repository::sqlite::SqliteRepository;
use sevworker_core::repository::{ConnectionRepository, SnapshotRepository, SyncStatusRepository, UserPreferencesRepository};
use sevworker_core::rpc::handlers::RpcHandlers;
use sevworker_core::rpc::wire::*;
use sevworker_core::vault::{CredentialVault, MasterKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Never reaches a real attestation source; used only so `Attestation`
/// can be constructed for `RpcHandlers::health_check`.
struct UnreachableSource;

#[async_trait::async_trait]
impl ReportSourceClient for UnreachableSource {
    async fn produce(&self, _nonce: [u8; 32]) -> AppResult<Report> {
        Err(AppError::upstream_unavailable("no attestation source in this harness"))
    }
}

fn build_handlers() -> (tempfile::TempDir, RpcHandlers) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sevworker.db");
    let repo = Arc::new(SqliteRepository::open(&db_path).unwrap());

    let connections: Arc<dyn ConnectionRepository> = repo.clone();
    let snapshots: Arc<dyn SnapshotRepository> = repo.clone();
    let sync_status: Arc<dyn SyncStatusRepository> = repo.clone();
    let preferences: Arc<dyn UserPreferencesRepository> = repo.clone();

    let vault = Arc::new(CredentialVault::new(MasterKey::derive("integration-test-secret"), connections.clone()));
    let registry = Arc::new(ConnectorRegistry::new());
    let aggregator = Arc::new(SnapshotAggregator::new(
        vault.clone(),
        registry,
        connections.clone(),
        snapshots.clone(),
        sync_status,
        preferences,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(repo));
    let attestation = Arc::new(Attestation::new(
        AttestationMode::Development,
        Box::new(UnreachableSource),
        EndorsementKeyStore::new(None),
    ));

    let handlers = RpcHandlers {
        vault,
        aggregator,
        rate_limiter,
        connections,
        snapshots,
        attestation,
        started_at: Instant::now(),
    };
    (dir, handlers)
}

#[tokio::test]
async fn create_user_connection_then_replay_returns_the_same_deterministic_user_id() {
    let (_dir, handlers) = build_handlers();

    let req = CreateUserConnectionRequest {
        venue: "binance".into(),
        label: "main".into(),
        key: "api-key-1".into(),
        secret: "api-secret-1".into(),
        passphrase: String::new(),
    };

    let first = match handlers.dispatch(RpcRequest::CreateUserConnection(req.clone())).await {
        RpcResponse::CreateUserConnection(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(first.success);
    assert!(first.error.is_empty());

    let second = match handlers.dispatch(RpcRequest::CreateUserConnection(req)).await {
        RpcResponse::CreateUserConnection(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(!second.success);
    assert_eq!(second.error, "already exists");
    assert_eq!(second.user_id, first.user_id, "deterministic user-id must resolve identically on replay");
}

#[tokio::test]
async fn create_user_connection_rejects_an_empty_label() {
    let (_dir, handlers) = build_handlers();

    let req = CreateUserConnectionRequest {
        venue: "binance".into(),
        label: String::new(),
        key: "api-key-1".into(),
        secret: "api-secret-1".into(),
        passphrase: String::new(),
    };

    match handlers.dispatch(RpcRequest::CreateUserConnection(req)).await {
        RpcResponse::Error { status_code, .. } => assert_eq!(status_code, 400),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn process_sync_job_fails_fast_when_no_connection_exists() {
    let (_dir, handlers) = build_handlers();

    let req = CreateUserConnectionRequest {
        venue: "okx".into(),
        label: "main".into(),
        key: "k".into(),
        secret: "s".into(),
        passphrase: String::new(),
    };
    let created = match handlers.dispatch(RpcRequest::CreateUserConnection(req)).await {
        RpcResponse::CreateUserConnection(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };

    // Deactivate isn't exercised here; instead drive the sync job against a
    // venue this user never connected, which still fails before any
    // Connector would be built.
    let sync_req = ProcessSyncJobRequest { user_id: created.user_id, venue: "bybit".into() };
    let response = match handlers.dispatch(RpcRequest::ProcessSyncJob(sync_req)).await {
        RpcResponse::ProcessSyncJob(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(!response.success);
    assert!(response.error.contains("no active connection"), "got: {}", response.error);
}

#[tokio::test]
async fn aggregated_metrics_and_time_series_read_back_inserted_snapshots() {
    let (_dir, handlers) = build_handlers();

    let user_id = sevworker_core::models::UserId(uuid::Uuid::new_v4());
    let mut breakdown = HashMap::new();
    breakdown.insert(
        Market::Spot,
        MarketMetrics { equity: 100.0, available_margin: 80.0, volume: 10.0, trades: 2, trading_fees: 0.1, funding_fees: 0.0 },
    );
    let snapshot = Snapshot {
        user_id,
        venue_id: VenueId::Binance,
        timestamp: Utc::now(),
        total_equity: 100.0,
        realized_balance: 99.9,
        unrealized_pnl: 0.0,
        deposits: 0.0,
        withdrawals: 0.0,
        breakdown,
    };
    handlers.snapshots.insert(&snapshot).await.unwrap();

    let metrics_req = GetAggregatedMetricsRequest { user_id: user_id.0.to_string(), venue: String::new() };
    let metrics = match handlers.dispatch(RpcRequest::GetAggregatedMetrics(metrics_req)).await {
        RpcResponse::GetAggregatedMetrics(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(metrics.success);
    assert_eq!(metrics.total_equity, 100.0);
    assert_eq!(metrics.realized_balance, 99.9);

    let series_req = GetSnapshotTimeSeriesRequest { user_id: user_id.0.to_string(), venue: String::new(), start: 0, end: 0 };
    let series = match handlers.dispatch(RpcRequest::GetSnapshotTimeSeries(series_req)).await {
        RpcResponse::GetSnapshotTimeSeries(r) => r,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(series.success);
    assert_eq!(series.snapshots.len(), 1);
}

#[tokio::test]
async fn get_aggregated_metrics_not_found_when_no_snapshots_exist() {
    let (_dir, handlers) = build_handlers();
    let user_id = uuid::Uuid::new_v4().to_string();
    let req = GetAggregatedMetricsRequest { user_id, venue: String::new() };
    match handlers.dispatch(RpcRequest::GetAggregatedMetrics(req)).await {
        RpcResponse::Error { status_code, .. } => assert_eq!(status_code, 404),
        other => panic!("expected a not-found error, got {other:?}"),
    }
}

#[tokio::test]
async fn health_check_reports_version_and_uptime() {
    let (_dir, handlers) = build_handlers();
    let health = match handlers.dispatch(RpcRequest::HealthCheck).await {
        RpcResponse::HealthCheck(h) => h,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    // Attestation never verifies in this harness, so status must report 0.
    assert_eq!(health.status, 0);
}
