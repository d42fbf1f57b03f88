//! Domain model shared across the vault, connector, aggregator and RPC layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque 128-bit user identifier, deterministically derived from credential
/// material by the vault (see `vault::derive_user_id`). Never constructed
/// directly outside the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of supported venues. The spec leaves the RPC venue enum
/// "permitted" but open; this build fixes a concrete allow-list so the
/// RPC validator (§4.9) has something to check requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueId {
    Binance,
    Okx,
    Bybit,
    BrokerFlex,
}

impl VenueId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Okx => "okx",
            VenueId::Bybit => "bybit",
            VenueId::BrokerFlex => "broker_flex",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Some(VenueId::Binance),
            "okx" => Some(VenueId::Okx),
            "bybit" => Some(VenueId::Bybit),
            "broker_flex" | "flex" | "broker-flex" => Some(VenueId::BrokerFlex),
            _ => None,
        }
    }

    /// Whether this venue is served by the report-pull broker family
    /// rather than the unified crypto family.
    pub fn is_report_pull(&self) -> bool {
        matches!(self, VenueId::BrokerFlex)
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One instrument category under which a venue's equity is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Global,
    Spot,
    Swap,
    Stocks,
    Futures,
    Options,
    Commodities,
    Forex,
    Cfd,
    Earn,
    Margin,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Global => "global",
            Market::Spot => "spot",
            Market::Swap => "swap",
            Market::Stocks => "stocks",
            Market::Futures => "futures",
            Market::Options => "options",
            Market::Commodities => "commodities",
            Market::Forex => "forex",
            Market::Cfd => "cfd",
            Market::Earn => "earn",
            Market::Margin => "margin",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-market metrics block stored inside a snapshot's breakdown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub equity: f64,
    pub available_margin: f64,
    pub volume: f64,
    pub trades: u64,
    pub trading_fees: f64,
    pub funding_fees: f64,
}

/// A stored API credential bundle for one (user, venue, label).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: UserId,
    pub venue_id: VenueId,
    pub label: String,
    /// `nonce || tag || ciphertext`, hex-encoded (see `vault`).
    pub encrypted_key: String,
    pub encrypted_secret: String,
    pub encrypted_passphrase: Option<String>,
    /// SHA-256 over the canonical `key:secret:passphrase` string.
    pub credentials_fingerprint: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One coarse, aggregated equity snapshot for (user, venue, timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: UserId,
    pub venue_id: VenueId,
    pub timestamp: DateTime<Utc>,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
    pub breakdown: HashMap<Market, MarketMetrics>,
}

impl Snapshot {
    /// realized_balance must equal total_equity - unrealized_pnl (§3, §8).
    pub fn with_derived_realized_balance(mut self) -> Self {
        self.realized_balance = self.total_equity - self.unrealized_pnl;
        self
    }

    pub fn global(&self) -> Option<&MarketMetrics> {
        self.breakdown.get(&Market::Global)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Syncing,
    Completed,
    Error,
}

/// Ephemeral, overwritten-per-attempt status of the most recent sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: UserId,
    pub venue_id: VenueId,
    pub last_sync_time: DateTime<Utc>,
    pub status: SyncState,
    pub total_trades_observed: u64,
    pub last_error: Option<String>,
}

/// One row of the 7-day-retained rate-limit audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitLog {
    pub user_id: UserId,
    pub venue_id: VenueId,
    pub last_sync_time: DateTime<Utc>,
    pub count: u64,
}

/// A single executed fill, as returned by a connector. Never persisted
/// (per spec.md Non-goals — no individual-trade storage); consumed only
/// by the aggregator to compute per-market volume/fee/funding totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub amount: f64,
    pub cost: Option<f64>,
    pub fee: Option<f64>,
}

impl Fill {
    /// `cost` if present else `price * amount` (§4.6 step 5).
    pub fn volume(&self) -> f64 {
        self.cost.unwrap_or(self.price * self.amount)
    }
}

/// A currently open position, as returned by a connector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub unrealized_pnl: f64,
    pub size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_id_round_trips_through_str() {
        for v in [VenueId::Binance, VenueId::Okx, VenueId::Bybit, VenueId::BrokerFlex] {
            assert_eq!(VenueId::from_str(v.as_str()), Some(v));
        }
        assert_eq!(VenueId::from_str("unknown"), None);
    }

    #[test]
    fn fill_volume_prefers_cost() {
        let f = Fill {
            symbol: "BTC/USDT".into(),
            timestamp: Utc::now(),
            price: 100.0,
            amount: 2.0,
            cost: Some(150.0),
            fee: None,
        };
        assert_eq!(f.volume(), 150.0);

        let g = Fill { cost: None, ..f };
        assert_eq!(g.volume(), 200.0);
    }

    #[test]
    fn snapshot_derives_realized_balance() {
        let s = Snapshot {
            user_id: UserId(Uuid::nil()),
            venue_id: VenueId::Binance,
            timestamp: Utc::now(),
            total_equity: 1000.0,
            realized_balance: 0.0,
            unrealized_pnl: 50.0,
            deposits: 0.0,
            withdrawals: 0.0,
            breakdown: HashMap::new(),
        }
        .with_derived_realized_balance();
        assert!((s.realized_balance - 950.0).abs() < 1e-9);
    }
}
