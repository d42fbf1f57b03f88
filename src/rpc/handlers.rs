//! RPC operation handlers (spec.md §4.9): validate → translate → shape →
//! map errors. Every validation failure and every internal error is logged
//! through the Redactor before the structured fields ever reach `tracing`.

use crate::aggregator::SnapshotAggregator;
use crate::attestation::Attestation;
use crate::error::{AppError, AppResult};
use crate::models::VenueId;
use crate::rate_limiter::RateLimiter;
use crate::redact::redact_serializable;
use crate::repository::{ConnectionRepository, SnapshotRepository};
use crate::rpc::validate;
use crate::rpc::wire::*;
use crate::vault::CredentialVault;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

pub struct RpcHandlers {
    pub vault: Arc<CredentialVault>,
    pub aggregator: Arc<SnapshotAggregator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub attestation: Arc<Attestation>,
    pub started_at: Instant,
}

impl RpcHandlers {
    /// Single entry point the transport layer dispatches every decoded
    /// `RpcRequest` through. Never panics on bad input — every failure
    /// becomes an `RpcResponse::Error` carrying a transport status code.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let result = match request {
            RpcRequest::CreateUserConnection(req) => self.create_user_connection(req).await.map(RpcResponse::CreateUserConnection),
            RpcRequest::ProcessSyncJob(req) => self.process_sync_job(req).await.map(RpcResponse::ProcessSyncJob),
            RpcRequest::GetAggregatedMetrics(req) => self.get_aggregated_metrics(req).await.map(RpcResponse::GetAggregatedMetrics),
            RpcRequest::GetSnapshotTimeSeries(req) => self.get_snapshot_time_series(req).await.map(RpcResponse::GetSnapshotTimeSeries),
            RpcRequest::HealthCheck => Ok(RpcResponse::HealthCheck(self.health_check().await)),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                let redacted = redact_serializable(&serde_json::json!({ "message": e.message }));
                if e.kind == crate::error::ErrorKind::Internal {
                    error!(status_code = e.kind.status_code(), payload = %redacted, "rpc handler internal error");
                } else {
                    warn!(status_code = e.kind.status_code(), payload = %redacted, "rpc handler rejected request");
                }
                RpcResponse::Error { status_code: e.kind.status_code(), message: e.message }
            }
        }
    }

    async fn create_user_connection(&self, req: CreateUserConnectionRequest) -> AppResult<CreateUserConnectionResponse> {
        let venue = validate::parse_required_venue(&req.venue)?;
        validate::validate_label(&req.label)?;
        validate::require_non_empty("key", &req.key)?;
        validate::require_non_empty("secret", &req.secret)?;
        let passphrase = validate::normalize_optional(&req.passphrase);

        match self.vault.create_connection(venue, &req.label, &req.key, &req.secret, passphrase).await {
            Ok(connection) => Ok(CreateUserConnectionResponse {
                success: true,
                user_id: connection.user_id.to_string(),
                error: String::new(),
            }),
            Err(e) if e.kind == crate::error::ErrorKind::Conflict => {
                // Deterministic user-id still resolves even on the
                // "already exists" path (spec.md §8 scenario 1).
                let user_id = self.vault.derive_user_id(venue, &req.key, &req.secret, passphrase);
                Ok(CreateUserConnectionResponse {
                    success: false,
                    user_id: user_id.to_string(),
                    error: "already exists".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn process_sync_job(&self, req: ProcessSyncJobRequest) -> AppResult<ProcessSyncJobResponse> {
        let user_id = validate::parse_user_id(&req.user_id)?;
        let venue = validate::parse_optional_venue(&req.venue)?;

        let venues: Vec<VenueId> = match venue {
            Some(v) => vec![v],
            None => {
                let mut vs: Vec<VenueId> = self
                    .connections
                    .list_for_user(user_id)
                    .await?
                    .into_iter()
                    .filter(|c| c.active)
                    .map(|c| c.venue_id)
                    .collect();
                vs.sort_by_key(|v| v.as_str());
                vs.dedup();
                vs
            }
        };

        let mut synced = 0u64;
        let mut snapshots_generated = 0u64;
        let mut latest_snapshot = None;
        let mut first_error: Option<String> = None;

        for v in &venues {
            let already_synced = self.snapshots.latest(user_id, *v).await?.is_some();
            let backfill_capable = self.aggregator.supports_historical_summaries(user_id, *v).await.unwrap_or(false);

            match sync_action(already_synced, backfill_capable) {
                SyncAction::Forbidden => {
                    first_error.get_or_insert_with(|| format!("{v}: automatic snapshots already exist; manual sync forbidden"));
                    continue;
                }
                SyncAction::Backfill => {
                    match self.aggregator.backfill_historical(user_id, *v).await {
                        Ok(created) => {
                            synced += 1;
                            snapshots_generated += created;
                        }
                        Err(e) => {
                            first_error.get_or_insert_with(|| e.message.clone());
                        }
                    }
                    // Today's snapshot follows on the next manual sync
                    // call, once the historical backfill above has landed.
                    continue;
                }
                SyncAction::Update => {}
            }

            let admission = self.rate_limiter.check(user_id, *v).await?;
            if !admission.allowed {
                first_error.get_or_insert_with(|| format!("{v}: {}", admission.reason.unwrap_or_default()));
                continue;
            }

            match self.aggregator.update_current(user_id, *v).await {
                Ok(snapshot) => {
                    self.rate_limiter.record(user_id, *v).await?;
                    synced += 1;
                    snapshots_generated += 1;
                    latest_snapshot = Some(SnapshotWire::from(&snapshot));
                }
                Err(e) => {
                    first_error.get_or_insert_with(|| e.message.clone());
                }
            }
        }

        Ok(ProcessSyncJobResponse {
            success: first_error.is_none(),
            user_id: user_id.to_string(),
            venue: venue.map(|v| v.to_string()).unwrap_or_default(),
            synced,
            snapshots_generated,
            latest_snapshot,
            error: first_error.unwrap_or_default(),
        })
    }

    async fn get_aggregated_metrics(&self, req: GetAggregatedMetricsRequest) -> AppResult<GetAggregatedMetricsResponse> {
        let user_id = validate::parse_user_id(&req.user_id)?;
        let venue = validate::parse_optional_venue(&req.venue)?;

        let snapshots = match venue {
            Some(v) => self.snapshots.latest(user_id, v).await?.into_iter().collect::<Vec<_>>(),
            None => self.snapshots.latest_for_all_venues(user_id).await?,
        };

        if snapshots.is_empty() {
            return Err(AppError::not_found("no snapshots for this user/venue"));
        }

        let mut total_equity = 0.0;
        let mut realized_balance = 0.0;
        let mut unrealized_pnl = 0.0;
        let mut breakdown = std::collections::HashMap::new();
        for s in &snapshots {
            total_equity += s.total_equity;
            realized_balance += s.realized_balance;
            unrealized_pnl += s.unrealized_pnl;
            for (market, metrics) in &s.breakdown {
                let entry: &mut crate::models::MarketMetrics = breakdown.entry(*market).or_default();
                entry.equity += metrics.equity;
                entry.available_margin += metrics.available_margin;
                entry.volume += metrics.volume;
                entry.trades += metrics.trades;
                entry.trading_fees += metrics.trading_fees;
                entry.funding_fees += metrics.funding_fees;
            }
        }

        Ok(GetAggregatedMetricsResponse {
            success: true,
            total_equity,
            realized_balance,
            unrealized_pnl,
            breakdown: market_breakdown_to_wire(&breakdown),
            error: String::new(),
        })
    }

    async fn get_snapshot_time_series(&self, req: GetSnapshotTimeSeriesRequest) -> AppResult<GetSnapshotTimeSeriesResponse> {
        let user_id = validate::parse_user_id(&req.user_id)?;
        let venue = validate::parse_optional_venue(&req.venue)?;
        let (start, end) = validate::parse_optional_range(req.start, req.end)?;
        let start = start.unwrap_or_else(|| Utc::now() - chrono::Duration::days(365));
        let end = end.unwrap_or_else(Utc::now);

        let venues: Vec<VenueId> = match venue {
            Some(v) => vec![v],
            None => {
                let mut vs: Vec<VenueId> =
                    self.connections.list_for_user(user_id).await?.into_iter().map(|c| c.venue_id).collect();
                vs.sort_by_key(|v| v.as_str());
                vs.dedup();
                vs
            }
        };

        let mut all = Vec::new();
        for v in venues {
            all.extend(self.snapshots.between(user_id, v, start, end).await?);
        }
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(GetSnapshotTimeSeriesResponse {
            success: true,
            snapshots: all.iter().map(SnapshotWire::from).collect(),
            error: String::new(),
        })
    }

    async fn health_check(&self) -> HealthCheckResponse {
        let verified = self.attestation.last_summary().map(|s| s.verified).unwrap_or(false);
        HealthCheckResponse {
            status: if verified { 1 } else { 0 },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// What a manual sync does for one (user, venue) pair, given whether a
/// snapshot already exists and whether the connector can backfill history
/// (spec.md §4.7, §8 scenario 3). Split out as a pure function so the
/// policy is testable without a live connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncAction {
    /// An automatic snapshot already exists and this connector has no
    /// backfill path — refuse the manual sync outright.
    Forbidden,
    /// No snapshot exists yet and the connector can backfill history —
    /// run `backfillHistorical` instead of the incremental update.
    Backfill,
    /// Run the ordinary incremental update.
    Update,
}

fn sync_action(already_synced: bool, backfill_capable: bool) -> SyncAction {
    if backfill_capable && !already_synced {
        SyncAction::Backfill
    } else if already_synced && !backfill_capable {
        SyncAction::Forbidden
    } else {
        SyncAction::Update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_capable_venue_backfills_on_first_sync_then_updates() {
        assert_eq!(sync_action(false, true), SyncAction::Backfill);
        assert_eq!(sync_action(true, true), SyncAction::Update);
    }

    #[test]
    fn ordinary_venue_is_forbidden_once_an_automatic_snapshot_exists() {
        assert_eq!(sync_action(false, false), SyncAction::Update);
        assert_eq!(sync_action(true, false), SyncAction::Forbidden);
    }
}
