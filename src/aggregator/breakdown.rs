//! Symbol-pattern market classification and breakdown composition
//! (spec.md §4.6 steps 5-7). Pure functions — no teacher equivalent exists
//! for this business logic (see DESIGN.md); grounded on the teacher's
//! general style of small, directly-testable classification helpers
//! (e.g. `edge::classify_edge_band` in the now-trimmed teacher code).

use crate::models::{Fill, Market, MarketMetrics};
use std::collections::{HashMap, HashSet};

/// Classifies one symbol into exactly one market, per the literal
/// symbol-pattern rules in spec.md §4.6 step 5.
pub fn classify_symbol(symbol: &str) -> Market {
    let upper = symbol.to_ascii_uppercase();
    if upper.contains(":USDT") || upper.contains(":USD") || upper.contains(":BUSD") || upper.contains("PERP") || upper.contains("SWAP") {
        return Market::Swap;
    }
    if has_six_consecutive_digits(&upper) {
        return Market::Futures;
    }
    if upper.ends_with("-C") || upper.ends_with("-P") {
        return Market::Options;
    }
    Market::Spot
}

fn has_six_consecutive_digits(s: &str) -> bool {
    let mut run = 0;
    for c in s.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= 6 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Folds a day's fills into per-market volume/fee totals (spec.md §4.6
/// step 5: "Volume for a fill is cost if present else price × amount;
/// trading fees are summed from per-fill fee blocks").
pub fn fold_fills_into_breakdown(breakdown: &mut HashMap<Market, MarketMetrics>, fills: &[Fill]) {
    for fill in fills {
        let market = classify_symbol(&fill.symbol);
        let entry = breakdown.entry(market).or_default();
        entry.volume += fill.volume();
        entry.trades += 1;
        entry.trading_fees += fill.fee.unwrap_or(0.0);
    }
}

/// Distinct symbols among the day's fills that classify as `Market::Swap`
/// (spec.md §4.6 step 5: "Funding fees are summed over perpetual symbols
/// observed in the day's fills") — the set handed to the connector's
/// funding-fees fetch.
pub fn perpetual_symbols(fills: &[Fill]) -> Vec<String> {
    let mut seen = HashSet::new();
    fills
        .iter()
        .map(|f| f.symbol.clone())
        .filter(|symbol| classify_symbol(symbol) == Market::Swap && seen.insert(symbol.clone()))
        .collect()
}

/// Rolls the `global` entry from the non-global per-market entries
/// (spec.md §4.6 step 7): equity is authoritative as passed in (either a
/// venue-reported total or a sum the caller already computed); volume,
/// trade count, and trading fees are the sum over markets; funding fees
/// equal the perpetual-funding total.
pub fn roll_global(breakdown: &mut HashMap<Market, MarketMetrics>, global_equity: f64, global_available_margin: f64, funding_fees: f64) {
    let (volume, trades, trading_fees) = breakdown
        .iter()
        .filter(|(m, _)| **m != Market::Global)
        .fold((0.0, 0u64, 0.0), |(v, t, f), (_, metrics)| {
            (v + metrics.volume, t + metrics.trades, f + metrics.trading_fees)
        });

    breakdown.insert(
        Market::Global,
        MarketMetrics {
            equity: global_equity,
            available_margin: global_available_margin,
            volume,
            trades,
            trading_fees,
            funding_fees,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn classifies_swap_future_option_and_spot_symbols() {
        assert_eq!(classify_symbol("BTC:USDT-PERP"), Market::Swap);
        assert_eq!(classify_symbol("BTCUSD_240628"), Market::Futures);
        assert_eq!(classify_symbol("BTC-28JUN24-70000-C"), Market::Options);
        assert_eq!(classify_symbol("BTCUSDT"), Market::Spot);
    }

    #[test]
    fn swap_pattern_takes_priority_over_digit_run() {
        // Contains both a SWAP marker and six consecutive digits; the spec
        // orders the rules swap-first.
        assert_eq!(classify_symbol("BTC-SWAP-202406"), Market::Swap);
    }

    #[test]
    fn folds_fills_summing_volume_trades_and_fees_per_market() {
        let mut breakdown = HashMap::new();
        let fills = vec![
            Fill { symbol: "BTCUSDT".into(), timestamp: Utc::now(), price: 100.0, amount: 2.0, cost: None, fee: Some(1.0) },
            Fill { symbol: "ETHUSDT".into(), timestamp: Utc::now(), price: 10.0, amount: 1.0, cost: Some(9.0), fee: Some(0.5) },
        ];
        fold_fills_into_breakdown(&mut breakdown, &fills);

        let spot = breakdown.get(&Market::Spot).unwrap();
        assert_eq!(spot.volume, 200.0 + 9.0);
        assert_eq!(spot.trades, 2);
        assert_eq!(spot.trading_fees, 1.5);
    }

    #[test]
    fn perpetual_symbols_dedupes_and_skips_non_swap_fills() {
        let fills = vec![
            Fill { symbol: "BTC:USDT-PERP".into(), timestamp: Utc::now(), price: 100.0, amount: 1.0, cost: None, fee: None },
            Fill { symbol: "BTC:USDT-PERP".into(), timestamp: Utc::now(), price: 101.0, amount: 1.0, cost: None, fee: None },
            Fill { symbol: "ETHUSDT".into(), timestamp: Utc::now(), price: 10.0, amount: 1.0, cost: None, fee: None },
        ];
        assert_eq!(perpetual_symbols(&fills), vec!["BTC:USDT-PERP".to_string()]);
    }

    #[test]
    fn global_rolls_up_sum_of_non_global_markets() {
        let mut breakdown = HashMap::new();
        breakdown.insert(Market::Spot, MarketMetrics { volume: 100.0, trades: 2, trading_fees: 1.0, ..Default::default() });
        breakdown.insert(Market::Swap, MarketMetrics { volume: 50.0, trades: 1, trading_fees: 0.5, ..Default::default() });

        roll_global(&mut breakdown, 1000.0, 900.0, 2.0);

        let global = breakdown.get(&Market::Global).unwrap();
        assert_eq!(global.equity, 1000.0);
        assert_eq!(global.volume, 150.0);
        assert_eq!(global.trades, 3);
        assert_eq!(global.trading_fees, 1.5);
        assert_eq!(global.funding_fees, 2.0);
    }
}
