// Order Flow Analyzer - buy/sell pressure and large-order flow
// Emits accumulation/distribution candidates from 5-minute trade windows

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use crate::core::config::MonitoringConfig;
use crate::core::types::{Candidate, Direction, OrderSide, Producer, SignalKind};
use crate::layer2::buffers::BufferManager;

const FLOW_WINDOW_MS: i64 = 300_000;
const ACCUMULATION_RATIO: f64 = 0.65;
const DISTRIBUTION_RATIO: f64 = 0.35;
const MIN_TRADES: usize = 10;

/// Per-symbol order-flow summary for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderFlowSummary {
    pub symbol: String,
    pub buy_ratio: f64,
    pub sell_ratio: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub large_buys: usize,
    pub large_sells: usize,
    pub total_trades: usize,
    pub last_update_ts: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OrderFlowStats {
    pub analyses: u64,
    pub candidates_emitted: u64,
    pub debounced: u64,
}

/// Detects directional order-flow imbalances. Runs on the analyzer
/// cadence and on trade appends once the per-symbol debounce elapses.
pub struct OrderFlowAnalyzer {
    monitoring: MonitoringConfig,
    debounce_ms: i64,
    last_run: HashMap<String, i64>,
    stats: OrderFlowStats,
}

impl OrderFlowAnalyzer {
    pub fn new(monitoring: MonitoringConfig) -> Self {
        let debounce_ms = monitoring.trade_debounce_ms;
        Self {
            monitoring,
            debounce_ms,
            last_run: HashMap::new(),
            stats: OrderFlowStats::default(),
        }
    }

    /// Trade-append trigger: skipped while the debounce window is open.
    pub fn analyze_debounced(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        if let Some(last) = self.last_run.get(symbol) {
            if now_ms - last < self.debounce_ms {
                self.stats.debounced += 1;
                return None;
            }
        }
        self.analyze(buffers, symbol, now_ms)
    }

    /// Inspect the last 5 minutes of trades for a one-sided imbalance
    /// backed by whale-sized orders.
    pub fn analyze(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        self.last_run.insert(symbol.to_string(), now_ms);
        self.stats.analyses += 1;

        let trades = buffers.snapshot_trades(symbol, now_ms - FLOW_WINDOW_MS);
        if trades.len() < MIN_TRADES {
            return None;
        }

        let buy_volume: Decimal = trades
            .iter()
            .filter(|t| t.side == OrderSide::Buy)
            .map(|t| t.notional_usd)
            .sum();
        let total_volume: Decimal = trades.iter().map(|t| t.notional_usd).sum();
        if total_volume <= Decimal::ZERO {
            return None;
        }
        let sell_volume = total_volume - buy_volume;
        let buy_ratio = (buy_volume / total_volume).to_f64().unwrap_or(0.5);

        let tier = self.monitoring.tier_of(symbol);
        let large_threshold = self.monitoring.large_order_threshold(tier);
        let large_buys = trades
            .iter()
            .filter(|t| t.side == OrderSide::Buy && t.notional_usd >= large_threshold)
            .count();
        let large_sells = trades
            .iter()
            .filter(|t| t.side == OrderSide::Sell && t.notional_usd >= large_threshold)
            .count();

        let min_large = self.monitoring.flow_min_large_orders as usize;
        let (kind, direction, large_dominant) =
            if buy_ratio >= ACCUMULATION_RATIO && large_buys >= min_large {
                (SignalKind::Accumulation, Direction::Long, large_buys)
            } else if buy_ratio <= DISTRIBUTION_RATIO && large_sells >= min_large {
                (SignalKind::Distribution, Direction::Short, large_sells)
            } else {
                return None;
            };

        let raw_score = 50.0
            + 30.0 * (buy_ratio - 0.5).abs() * 2.0
            + (2.0 * large_dominant as f64).min(15.0);

        self.stats.candidates_emitted += 1;
        info!(
            symbol = symbol,
            kind = %kind,
            buy_ratio = format!("{:.1}%", buy_ratio * 100.0),
            whales = format!("{}B/{}S", large_buys, large_sells),
            score = format!("{:.1}", raw_score),
            "Order flow candidate"
        );

        Some(Candidate {
            producer: Producer::OrderFlow,
            kind,
            symbol: symbol.to_string(),
            direction,
            raw_score,
            zone: None,
            levels: None,
            metadata: json!({
                "buy_volume": buy_volume,
                "sell_volume": sell_volume,
                "buy_ratio": buy_ratio,
                "large_buys": large_buys,
                "large_sells": large_sells,
                "net_delta": buy_volume - sell_volume,
                "total_trades": trades.len(),
                "window_secs": FLOW_WINDOW_MS / 1_000,
            }),
            ts: now_ms,
        })
    }

    /// Dashboard view of the current flow for a symbol; None when there is
    /// nothing in the window.
    pub fn summarize(
        &self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<OrderFlowSummary> {
        let trades = buffers.snapshot_trades(symbol, now_ms - FLOW_WINDOW_MS);
        if trades.is_empty() {
            return None;
        }

        let buy_volume: Decimal = trades
            .iter()
            .filter(|t| t.side == OrderSide::Buy)
            .map(|t| t.notional_usd)
            .sum();
        let total: Decimal = trades.iter().map(|t| t.notional_usd).sum();
        let sell_volume = total - buy_volume;
        let buy_ratio = if total > Decimal::ZERO {
            (buy_volume / total).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let tier = self.monitoring.tier_of(symbol);
        let large_threshold = self.monitoring.large_order_threshold(tier);

        Some(OrderFlowSummary {
            symbol: symbol.to_string(),
            buy_ratio,
            sell_ratio: 1.0 - buy_ratio,
            buy_volume: buy_volume.to_f64().unwrap_or(0.0),
            sell_volume: sell_volume.to_f64().unwrap_or(0.0),
            large_buys: trades
                .iter()
                .filter(|t| t.side == OrderSide::Buy && t.notional_usd >= large_threshold)
                .count(),
            large_sells: trades
                .iter()
                .filter(|t| t.side == OrderSide::Sell && t.notional_usd >= large_threshold)
                .count(),
            total_trades: trades.len(),
            last_update_ts: trades.last().map(|t| t.ts).unwrap_or(now_ms),
        })
    }

    pub fn get_stats(&self) -> OrderFlowStats {
        self.stats.clone()
    }
}
