//! Report-pull broker connector (spec.md §4.4), e.g. "broker Flex": a
//! two-step asynchronous protocol — submit {token, query-id}, then poll a
//! retrieval endpoint until the document is ready, retrying a fixed number
//! of times on a "not ready" code. The returned document is XML-like and is
//! parsed into typed record lists.

use crate::connector::HistoricalSummary;
use crate::error::{AppError, AppResult};
use crate::models::MarketMetrics;
use crate::report_cache::ReportCache;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const MAX_POLL_ATTEMPTS: u32 = 20;
const POLL_BACKOFF: Duration = Duration::from_millis(500);
const SUBMIT_PATH: &str = "https://www.brokerflex.example/FlexStatementService.SendRequest";
const RETRIEVE_PATH: &str = "https://www.brokerflex.example/FlexStatementService.GetStatement";

pub struct FlexConnector {
    http: Client,
    token: String,
    query_id: String,
    cache: Arc<ReportCache>,
}

impl FlexConnector {
    pub fn new(token: Vec<u8>, query_id: Vec<u8>, cache: Arc<ReportCache>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("failed to build broker http client"),
            token: String::from_utf8_lossy(&token).to_string(),
            query_id: String::from_utf8_lossy(&query_id).to_string(),
            cache,
        }
    }

    pub async fn test_connection(&self) -> AppResult<()> {
        self.document().await.map(|_| ())
    }

    /// Fetches the statement document, going through the cache's
    /// single-flight path so concurrent callers within 60s share one
    /// outbound request pair (spec.md §4.5).
    async fn document(&self) -> AppResult<FlexDocument> {
        let key = (self.token.clone(), self.query_id.clone());
        let raw = self
            .cache
            .get_or_fetch(key, || self.fetch_document())
            .await?;
        parse_flex_document(&raw)
    }

    async fn fetch_document(&self) -> AppResult<String> {
        let reference = self.submit_request().await?;
        self.poll_for_statement(&reference).await
    }

    async fn submit_request(&self) -> AppResult<String> {
        let response = self
            .http
            .get(SUBMIT_PATH)
            .query(&[("t", self.token.as_str()), ("q", self.query_id.as_str()), ("v", "3")])
            .send()
            .await
            .map_err(|e| AppError::upstream_unavailable(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| AppError::upstream_unavailable(e.to_string()))?;
        extract_tag(&body, "ReferenceCode")
            .ok_or_else(|| AppError::upstream_unavailable("broker did not return a reference code"))
    }

    async fn poll_for_statement(&self, reference: &str) -> AppResult<String> {
        for attempt in 0..MAX_POLL_ATTEMPTS {
            let response = self
                .http
                .get(RETRIEVE_PATH)
                .query(&[("t", self.token.as_str()), ("q", reference)])
                .send()
                .await
                .map_err(|e| AppError::upstream_unavailable(e.to_string()))?;
            let body = response
                .text()
                .await
                .map_err(|e| AppError::upstream_unavailable(e.to_string()))?;

            if !is_not_ready(&body) {
                return Ok(body);
            }
            if attempt + 1 == MAX_POLL_ATTEMPTS {
                break;
            }
            sleep(POLL_BACKOFF).await;
        }
        Err(AppError::upstream_unavailable("statement not ready after maximum poll attempts"))
    }

    pub async fn balance(&self) -> AppResult<MarketMetrics> {
        let doc = self.document().await?;
        let latest = doc
            .account_summaries
            .last()
            .ok_or_else(|| AppError::upstream_unavailable("no account summaries in statement"))?;
        Ok(MarketMetrics { equity: latest.total_equity, ..Default::default() })
    }

    pub async fn historical_summaries(&self) -> AppResult<Vec<HistoricalSummary>> {
        let doc = self.document().await?;
        Ok(doc
            .account_summaries
            .into_iter()
            .filter(|s| s.total_equity != 0.0)
            .map(|s| HistoricalSummary {
                date: s.date,
                total_equity: s.total_equity,
                realized_balance: s.total_equity - s.unrealized_pnl,
                unrealized_pnl: s.unrealized_pnl,
                deposits: s.deposits,
                withdrawals: s.withdrawals,
            })
            .collect())
    }
}

fn is_not_ready(body: &str) -> bool {
    body.contains("<ErrorCode>1019</ErrorCode>") || body.contains("Statement generation in progress")
}

struct FlexDocument {
    account_summaries: Vec<FlexAccountSummary>,
}

struct FlexAccountSummary {
    date: DateTime<Utc>,
    total_equity: f64,
    unrealized_pnl: f64,
    deposits: f64,
    withdrawals: f64,
}

/// Minimal tag-delimited extraction over the broker's XML-like report
/// format. A full XML parser is unwarranted for the closed tag set this
/// connector reads (spec.md Non-goals carve out the rest of the document).
fn parse_flex_document(body: &str) -> AppResult<FlexDocument> {
    let summaries = extract_all_tags(body, "AccountSummary")
        .into_iter()
        .map(|block| FlexAccountSummary {
            date: extract_tag(&block, "Date")
                .and_then(|d| parse_flex_date(&d))
                .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap()),
            total_equity: extract_tag(&block, "TotalEquity").and_then(|s| s.parse().ok()).unwrap_or(0.0),
            unrealized_pnl: extract_tag(&block, "UnrealizedPnl").and_then(|s| s.parse().ok()).unwrap_or(0.0),
            deposits: extract_tag(&block, "Deposits").and_then(|s| s.parse().ok()).unwrap_or(0.0),
            withdrawals: extract_tag(&block, "Withdrawals").and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
        .collect();
    Ok(FlexDocument { account_summaries: summaries })
}

fn parse_flex_date(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDate::parse_from_str(s, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn extract_all_tags(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut cursor = 0;
    while let Some(rel_start) = body[cursor..].find(&open) {
        let start = cursor + rel_start;
        if let Some(rel_end) = body[start..].find(&close) {
            let end = start + rel_end + close.len();
            blocks.push(body[start..end].to_string());
            cursor = end;
        } else {
            break;
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_account_summaries() {
        let body = "<FlexStatement>\
            <AccountSummary><Date>20260101</Date><TotalEquity>1000.0</TotalEquity><UnrealizedPnl>10.0</UnrealizedPnl><Deposits>0</Deposits><Withdrawals>0</Withdrawals></AccountSummary>\
            <AccountSummary><Date>20260102</Date><TotalEquity>0</TotalEquity><UnrealizedPnl>0</UnrealizedPnl><Deposits>0</Deposits><Withdrawals>0</Withdrawals></AccountSummary>\
            </FlexStatement>";
        let doc = parse_flex_document(body).unwrap();
        assert_eq!(doc.account_summaries.len(), 2);
        assert_eq!(doc.account_summaries[0].total_equity, 1000.0);
    }

    #[test]
    fn not_ready_marker_is_detected() {
        assert!(is_not_ready("<FlexStatementResponse><ErrorCode>1019</ErrorCode></FlexStatementResponse>"));
        assert!(!is_not_ready("<FlexQueryResponse><FlexStatements>...</FlexStatements></FlexQueryResponse>"));
    }
}
