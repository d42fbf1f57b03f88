//! Connector abstraction (spec.md §4.4): one capability-based interface over
//! heterogeneous venue APIs, recast as a closed enum rather than the
//! duck-typed capability checks of the original — see `DESIGN.md` for the
//! REDESIGN-FLAG rationale.

pub mod broker_flex;
pub mod registry;
pub mod unified;

use crate::error::AppResult;
use crate::models::{Fill, Market, MarketMetrics, Position};
use broker_flex::FlexConnector;
use chrono::{DateTime, Utc};
use unified::UnifiedCryptoConnector;

/// A feature a caller may probe for before calling the corresponding
/// operation, since not every venue implements every capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Balance,
    CurrentPositions,
    ExecutedFills,
    BalanceBreakdown,
    FundingFees,
    EarnBalance,
    HistoricalSummaries,
}

/// One reporting-date summary row, as produced by a report-pull broker's
/// `getHistoricalSummaries` (spec.md §4.4, §4.6).
#[derive(Debug, Clone)]
pub struct HistoricalSummary {
    pub date: DateTime<Utc>,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
}

/// Decrypted material a Connector is constructed from. Retained for the
/// lifetime of the cached instance (spec.md §3 Ownership), wiped on
/// eviction by whoever holds the `ConnectorRegistry` entry.
pub struct ConnectorCredentials {
    pub key: Vec<u8>,
    pub secret: Vec<u8>,
    pub passphrase: Option<Vec<u8>>,
}

/// The two connector families named by spec.md §4.4, recast as a variant:
/// `Connector = Unified(Crypto) | Broker(Flex)`. Aggregator code consumes
/// only this variant-independent interface.
pub enum Connector {
    UnifiedCrypto(UnifiedCryptoConnector),
    BrokerFlex(FlexConnector),
}

impl Connector {
    pub fn supports(&self, capability: Capability) -> bool {
        match self {
            Connector::UnifiedCrypto(_) => matches!(
                capability,
                Capability::Balance
                    | Capability::CurrentPositions
                    | Capability::ExecutedFills
                    | Capability::BalanceBreakdown
                    | Capability::FundingFees
                    | Capability::EarnBalance
            ),
            Connector::BrokerFlex(_) => matches!(
                capability,
                Capability::Balance | Capability::HistoricalSummaries
            ),
        }
    }

    pub async fn test_connection(&self) -> AppResult<()> {
        match self {
            Connector::UnifiedCrypto(c) => c.test_connection().await,
            Connector::BrokerFlex(c) => c.test_connection().await,
        }
    }

    /// Discover the market types this connector currently holds balance in
    /// (crypto path). Broker connectors are treated as monolithic and
    /// return a single `Market::Global` entry (spec.md §4.6 step 3).
    pub async fn markets(&self) -> AppResult<Vec<Market>> {
        match self {
            Connector::UnifiedCrypto(c) => c.discover_markets().await,
            Connector::BrokerFlex(_) => Ok(vec![Market::Global]),
        }
    }

    pub async fn balance(&self, market: Market) -> AppResult<MarketMetrics> {
        match self {
            Connector::UnifiedCrypto(c) => c.balance(market).await,
            Connector::BrokerFlex(c) => c.balance().await,
        }
    }

    pub async fn current_positions(&self) -> AppResult<Vec<Position>> {
        match self {
            Connector::UnifiedCrypto(c) => c.current_positions().await,
            Connector::BrokerFlex(_) => Ok(Vec::new()),
        }
    }

    /// All fills observed since `since`, across every candidate symbol
    /// (spec.md §4.4 "universal" discovery). Unclassified by market — the
    /// aggregator's symbol-pattern rules (spec.md §4.6 step 5) assign each
    /// fill to exactly one market.
    pub async fn executed_fills(&self, since: DateTime<Utc>) -> AppResult<Vec<Fill>> {
        match self {
            Connector::UnifiedCrypto(c) => c.executed_fills(since).await,
            Connector::BrokerFlex(_) => Ok(Vec::new()),
        }
    }

    pub async fn funding_fees(&self, symbols: &[String], since: DateTime<Utc>) -> AppResult<f64> {
        match self {
            Connector::UnifiedCrypto(c) => c.funding_fees(symbols, since).await,
            Connector::BrokerFlex(_) => Ok(0.0),
        }
    }

    pub async fn historical_summaries(&self) -> AppResult<Vec<HistoricalSummary>> {
        match self {
            Connector::UnifiedCrypto(_) => Ok(Vec::new()),
            Connector::BrokerFlex(c) => c.historical_summaries().await,
        }
    }
}
