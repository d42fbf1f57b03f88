//! Wire shapes for the RPC surface (spec.md §4.9, §6). Framed as
//! bincode-encoded envelopes rather than JSON so the schema can evolve by
//! adding enum variants/fields without breaking older clients — the binary
//! framing spec.md §6 calls for, realized with the crates the teacher
//! already depends on (`axum` for transport, `bincode` for the envelope)
//! instead of introducing `tonic`/protobuf (see DESIGN.md).

use crate::models::{Market, MarketMetrics, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    CreateUserConnection(CreateUserConnectionRequest),
    ProcessSyncJob(ProcessSyncJobRequest),
    GetAggregatedMetrics(GetAggregatedMetricsRequest),
    GetSnapshotTimeSeries(GetSnapshotTimeSeriesRequest),
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    CreateUserConnection(CreateUserConnectionResponse),
    ProcessSyncJob(ProcessSyncJobResponse),
    GetAggregatedMetrics(GetAggregatedMetricsResponse),
    GetSnapshotTimeSeries(GetSnapshotTimeSeriesResponse),
    HealthCheck(HealthCheckResponse),
    Error { status_code: u16, message: String },
}

/// Raw, un-normalised request fields (spec.md §6: "empty string and the
/// literal string 0 are treated as absent for optional fields"). The
/// `validate` module is the only place that normalises these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserConnectionRequest {
    pub venue: String,
    pub label: String,
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserConnectionResponse {
    pub success: bool,
    pub user_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSyncJobRequest {
    pub user_id: String,
    /// Empty string means "all active venues for this user".
    pub venue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSyncJobResponse {
    pub success: bool,
    pub user_id: String,
    pub venue: String,
    pub synced: u64,
    pub snapshots_generated: u64,
    pub latest_snapshot: Option<SnapshotWire>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAggregatedMetricsRequest {
    pub user_id: String,
    pub venue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAggregatedMetricsResponse {
    pub success: bool,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub breakdown: HashMap<String, MarketMetrics>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSnapshotTimeSeriesRequest {
    pub user_id: String,
    pub venue: String,
    /// Milliseconds since epoch. 0 means absent (spec.md §6).
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSnapshotTimeSeriesResponse {
    pub success: bool,
    pub snapshots: Vec<SnapshotWire>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: u8,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Over-the-wire snapshot shape; `breakdown`'s keys are `Market::as_str()`
/// since bincode cannot serialize a map keyed by a non-string enum the way
/// the internal model does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWire {
    pub venue_id: String,
    pub timestamp_ms: i64,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
    pub breakdown: HashMap<String, MarketMetrics>,
}

impl From<&Snapshot> for SnapshotWire {
    fn from(s: &Snapshot) -> Self {
        Self {
            venue_id: s.venue_id.as_str().to_string(),
            timestamp_ms: s.timestamp.timestamp_millis(),
            total_equity: s.total_equity,
            realized_balance: s.realized_balance,
            unrealized_pnl: s.unrealized_pnl,
            deposits: s.deposits,
            withdrawals: s.withdrawals,
            breakdown: s.breakdown.iter().map(|(m, v)| (m.as_str().to_string(), *v)).collect(),
        }
    }
}

pub fn market_breakdown_to_wire(breakdown: &HashMap<Market, MarketMetrics>) -> HashMap<String, MarketMetrics> {
    breakdown.iter().map(|(m, v)| (m.as_str().to_string(), *v)).collect()
}
