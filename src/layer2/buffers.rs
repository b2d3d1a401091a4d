// Buffer Manager - per-symbol rolling time-series for liquidations and trades
// The sole shared mutable state of the hot path

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

use crate::core::types::{Liquidation, Trade};

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BufferStats {
    pub total_liquidations: u64,
    pub total_trades: u64,
    pub liquidations_buffered: usize,
    pub trades_buffered: usize,
    pub symbols_tracked: usize,
    pub dropped_cap_liquidations: u64,
    pub dropped_cap_trades: u64,
    pub dropped_ordering_liquidations: u64,
    pub dropped_ordering_trades: u64,
    pub swept: u64,
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffers(symbols={}, liqs={}/{}, trades={}/{}, drops: cap={}, order={})",
            self.symbols_tracked,
            self.liquidations_buffered,
            self.total_liquidations,
            self.trades_buffered,
            self.total_trades,
            self.dropped_cap_liquidations + self.dropped_cap_trades,
            self.dropped_ordering_liquidations + self.dropped_ordering_trades,
        )
    }
}

// ============================================================================
// Per-Symbol Buffers
// ============================================================================

#[derive(Default)]
struct SymbolBuffers {
    liquidations: VecDeque<Liquidation>,
    trades: VecDeque<Trade>,
}

// ============================================================================
// Buffer Manager
// ============================================================================

/// Bounded, time-ordered per-symbol sequences. Appends keep monotonic
/// order: an arrival older than the tail is inserted in order when it is
/// within the grace window, dropped (and counted) otherwise. Readers
/// always get copies and never observe mutation mid-iteration.
pub struct BufferManager {
    buffers: RwLock<HashMap<String, SymbolBuffers>>,
    max_liquidations: usize,
    max_trades: usize,
    retention_ms: i64,
    grace_ms: i64,
    stats: RwLock<BufferStats>,
}

impl BufferManager {
    pub fn new(
        max_liquidations: usize,
        max_trades: usize,
        retention_ms: i64,
        grace_ms: i64,
    ) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_liquidations,
            max_trades,
            retention_ms,
            grace_ms,
            stats: RwLock::new(BufferStats::default()),
        }
    }

    /// Append a liquidation. Returns false when the entry was dropped for
    /// violating the ordering grace window.
    pub fn append_liquidation(&self, liq: Liquidation) -> bool {
        let mut buffers = self.buffers.write();
        let entry = buffers.entry(liq.symbol.clone()).or_default();

        if let Some(last) = entry.liquidations.back() {
            if liq.ts < last.ts - self.grace_ms {
                drop(buffers);
                let mut stats = self.stats.write();
                stats.dropped_ordering_liquidations += 1;
                debug!(symbol = %liq.symbol, ts = liq.ts, "Liquidation dropped: out of order");
                return false;
            }
        }

        let evicted = if entry.liquidations.len() >= self.max_liquidations {
            entry.liquidations.pop_front();
            true
        } else {
            false
        };

        insert_ordered(&mut entry.liquidations, liq, |l| l.ts);
        drop(buffers);

        let mut stats = self.stats.write();
        stats.total_liquidations += 1;
        if evicted {
            stats.dropped_cap_liquidations += 1;
        }
        true
    }

    /// Append a trade. Same ordering and capacity rules as liquidations.
    pub fn append_trade(&self, trade: Trade) -> bool {
        let mut buffers = self.buffers.write();
        let entry = buffers.entry(trade.symbol.clone()).or_default();

        if let Some(last) = entry.trades.back() {
            if trade.ts < last.ts - self.grace_ms {
                drop(buffers);
                let mut stats = self.stats.write();
                stats.dropped_ordering_trades += 1;
                debug!(symbol = %trade.symbol, ts = trade.ts, "Trade dropped: out of order");
                return false;
            }
        }

        let evicted = if entry.trades.len() >= self.max_trades {
            entry.trades.pop_front();
            true
        } else {
            false
        };

        insert_ordered(&mut entry.trades, trade, |t| t.ts);
        drop(buffers);

        let mut stats = self.stats.write();
        stats.total_trades += 1;
        if evicted {
            stats.dropped_cap_trades += 1;
        }
        true
    }

    /// Copy of the contiguous tail with ts >= since_ts, time-ordered.
    pub fn snapshot_liquidations(&self, symbol: &str, since_ts: i64) -> Vec<Liquidation> {
        let buffers = self.buffers.read();
        match buffers.get(symbol) {
            Some(entry) => tail_since(&entry.liquidations, since_ts, |l| l.ts),
            None => Vec::new(),
        }
    }

    /// Copy of the contiguous tail with ts >= since_ts, time-ordered.
    pub fn snapshot_trades(&self, symbol: &str, since_ts: i64) -> Vec<Trade> {
        let buffers = self.buffers.read();
        match buffers.get(symbol) {
            Some(entry) => tail_since(&entry.trades, since_ts, |t| t.ts),
            None => Vec::new(),
        }
    }

    /// Most recent trade for a symbol, if any.
    pub fn last_trade(&self, symbol: &str) -> Option<Trade> {
        self.buffers.read().get(symbol).and_then(|e| e.trades.back().cloned())
    }

    /// Most recent liquidation for a symbol, if any.
    pub fn last_liquidation(&self, symbol: &str) -> Option<Liquidation> {
        self.buffers
            .read()
            .get(symbol)
            .and_then(|e| e.liquidations.back().cloned())
    }

    /// Drop entries older than the retention window. Called periodically.
    pub fn sweep(&self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        let mut swept = 0u64;

        let mut buffers = self.buffers.write();
        for entry in buffers.values_mut() {
            while entry.liquidations.front().map(|l| l.ts < cutoff).unwrap_or(false) {
                entry.liquidations.pop_front();
                swept += 1;
            }
            while entry.trades.front().map(|t| t.ts < cutoff).unwrap_or(false) {
                entry.trades.pop_front();
                swept += 1;
            }
        }
        drop(buffers);

        if swept > 0 {
            self.stats.write().swept += swept;
            debug!(swept = swept, "Buffer sweep");
        }
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.buffers.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn get_stats(&self) -> BufferStats {
        let mut stats = self.stats.read().clone();
        let buffers = self.buffers.read();
        stats.symbols_tracked = buffers.len();
        stats.liquidations_buffered = buffers.values().map(|e| e.liquidations.len()).sum();
        stats.trades_buffered = buffers.values().map(|e| e.trades.len()).sum();
        stats
    }
}

/// Push keeping ts order; in-grace late arrivals walk back to their slot.
fn insert_ordered<T>(deque: &mut VecDeque<T>, item: T, ts_of: impl Fn(&T) -> i64) {
    let ts = ts_of(&item);
    if deque.back().map(|last| ts_of(last) <= ts).unwrap_or(true) {
        deque.push_back(item);
        return;
    }
    let mut idx = deque.len();
    while idx > 0 && ts_of(&deque[idx - 1]) > ts {
        idx -= 1;
    }
    deque.insert(idx, item);
}

fn tail_since<T: Clone>(deque: &VecDeque<T>, since_ts: i64, ts_of: impl Fn(&T) -> i64) -> Vec<T> {
    let start = deque.partition_point(|item| ts_of(item) < since_ts);
    deque.iter().skip(start).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LiquidationSide, OrderSide};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn liq(ts: i64, notional: Decimal) -> Liquidation {
        Liquidation {
            symbol: "BTCUSDT".to_string(),
            exchange: "Binance".to_string(),
            price: dec!(96000),
            side: LiquidationSide::LongLiquidated,
            notional_usd: notional,
            ts,
        }
    }

    fn trade(ts: i64, notional: Decimal) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            exchange: "Binance".to_string(),
            price: dec!(96000),
            side: OrderSide::Buy,
            notional_usd: notional,
            ts,
        }
    }

    fn manager() -> BufferManager {
        BufferManager::new(1_000, 500, 3_600_000, 2_000)
    }

    #[test]
    fn test_snapshot_is_ordered_tail() {
        let m = manager();
        for i in 0..10 {
            m.append_trade(trade(1_000 * i, dec!(100)));
        }

        let snap = m.snapshot_trades("BTCUSDT", 5_000);
        assert_eq!(snap.len(), 5);
        assert!(snap.windows(2).all(|w| w[0].ts <= w[1].ts));
        assert!(snap.iter().all(|t| t.ts >= 5_000));
    }

    #[test]
    fn test_empty_snapshot_for_unknown_symbol() {
        let m = manager();
        assert!(m.snapshot_trades("NEVERSEEN", 0).is_empty());
        assert!(m.snapshot_liquidations("NEVERSEEN", 0).is_empty());
    }

    #[test]
    fn test_cap_eviction_counted() {
        let m = BufferManager::new(3, 3, 3_600_000, 2_000);
        for i in 0..5 {
            m.append_liquidation(liq(1_000 * i, dec!(100)));
        }

        let stats = m.get_stats();
        assert_eq!(stats.liquidations_buffered, 3);
        assert_eq!(stats.dropped_cap_liquidations, 2);
        assert_eq!(stats.total_liquidations, 5);

        // Oldest two evicted
        let snap = m.snapshot_liquidations("BTCUSDT", 0);
        assert_eq!(snap[0].ts, 2_000);
    }

    #[test]
    fn test_late_arrival_within_grace_inserted_in_order() {
        let m = manager();
        m.append_trade(trade(10_000, dec!(1)));
        m.append_trade(trade(11_000, dec!(2)));
        // 1.5s late: within 2s grace, must land between the two
        assert!(m.append_trade(trade(9_500, dec!(3))));

        let snap = m.snapshot_trades("BTCUSDT", 0);
        let ts: Vec<i64> = snap.iter().map(|t| t.ts).collect();
        assert_eq!(ts, vec![9_500, 10_000, 11_000]);
    }

    #[test]
    fn test_late_arrival_beyond_grace_dropped() {
        let m = manager();
        m.append_trade(trade(10_000, dec!(1)));
        // 3s earlier than tail: outside the 2s grace
        assert!(!m.append_trade(trade(7_000, dec!(2))));

        let stats = m.get_stats();
        assert_eq!(stats.dropped_ordering_trades, 1);
        assert_eq!(m.snapshot_trades("BTCUSDT", 0).len(), 1);
    }

    #[test]
    fn test_sweep_drops_expired() {
        let m = BufferManager::new(1_000, 500, 60_000, 2_000);
        m.append_trade(trade(0, dec!(1)));
        m.append_trade(trade(30_000, dec!(2)));
        m.append_trade(trade(70_000, dec!(3)));

        m.sweep(100_000);

        let snap = m.snapshot_trades("BTCUSDT", 0);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].ts, 70_000);
        assert_eq!(m.get_stats().swept, 2);
    }

    #[test]
    fn test_last_trade() {
        let m = manager();
        assert!(m.last_trade("BTCUSDT").is_none());
        m.append_trade(trade(1_000, dec!(1)));
        m.append_trade(trade(2_000, dec!(2)));
        assert_eq!(m.last_trade("BTCUSDT").unwrap().ts, 2_000);
    }
}
