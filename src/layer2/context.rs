// Market Context Buffer - OI & funding rate snapshot storage per symbol
// Bounded ring with time-series lookback for the context filter

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::core::types::ContextSnapshot;

/// Strip the quote suffix from a pair: BTCUSDT -> BTC, 1000PEPEUSDT -> 1000PEPE.
pub fn to_base_symbol(pair: &str) -> &str {
    for suffix in ["USDT", "BUSD", "USDC", "USD"] {
        if let Some(base) = pair.strip_suffix(suffix) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    pair
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ContextBufferStats {
    pub symbols_tracked: usize,
    pub total_snapshots: usize,
}

impl fmt::Display for ContextBufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContextBuffer(symbols={}, snapshots={})",
            self.symbols_tracked, self.total_snapshots
        )
    }
}

/// Rolling per-symbol ring of context snapshots (default 72 ≈ 6h at
/// 5-minute cadence). Keyed by base symbol.
pub struct ContextBuffer {
    max_snapshots: usize,
    buffers: RwLock<HashMap<String, VecDeque<ContextSnapshot>>>,
}

impl ContextBuffer {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_snapshot(&self, snapshot: ContextSnapshot) {
        let mut buffers = self.buffers.write();
        let ring = buffers.entry(snapshot.symbol.clone()).or_default();
        if ring.len() >= self.max_snapshots {
            ring.pop_front();
        }
        ring.push_back(snapshot);
    }

    /// Most recent snapshot for a base symbol.
    pub fn latest(&self, symbol: &str) -> Option<ContextSnapshot> {
        self.buffers.read().get(symbol).and_then(|r| r.back().cloned())
    }

    /// Open-interest change over the last hour as a percentage,
    /// `(oi_now − oi_1h_ago)/oi_1h_ago · 100`, with linear interpolation
    /// between the snapshots bracketing the 1h-ago instant. Falls back to
    /// the nearest snapshot when no bracket exists, provided it is within
    /// `tolerance_ms` of the target. None when data is insufficient.
    pub fn oi_change_1h_pct(&self, symbol: &str, now_ms: i64, tolerance_ms: i64) -> Option<f64> {
        let buffers = self.buffers.read();
        let ring = buffers.get(symbol)?;
        let latest = ring.back()?;
        if latest.open_interest_usd <= 0.0 {
            return None;
        }

        let target = now_ms - 3_600_000;
        let oi_then = interpolate_oi(ring, target, tolerance_ms)?;
        if oi_then <= 0.0 {
            return None;
        }

        Some((latest.open_interest_usd - oi_then) / oi_then * 100.0)
    }

    pub fn get_stats(&self) -> ContextBufferStats {
        let buffers = self.buffers.read();
        ContextBufferStats {
            symbols_tracked: buffers.len(),
            total_snapshots: buffers.values().map(|r| r.len()).sum(),
        }
    }
}

fn interpolate_oi(ring: &VecDeque<ContextSnapshot>, target: i64, tolerance_ms: i64) -> Option<f64> {
    let mut before: Option<&ContextSnapshot> = None;
    let mut after: Option<&ContextSnapshot> = None;

    for snap in ring.iter() {
        if snap.ts <= target {
            before = Some(snap);
        } else {
            after = Some(snap);
            break;
        }
    }

    match (before, after) {
        (Some(a), Some(b)) => {
            let span = (b.ts - a.ts) as f64;
            if span <= 0.0 {
                return Some(a.open_interest_usd);
            }
            let frac = (target - a.ts) as f64 / span;
            Some(a.open_interest_usd + frac * (b.open_interest_usd - a.open_interest_usd))
        }
        (Some(a), None) if (target - a.ts).abs() <= tolerance_ms => Some(a.open_interest_usd),
        (None, Some(b)) if (b.ts - target).abs() <= tolerance_ms => Some(b.open_interest_usd),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: i64, oi: f64, funding: f64) -> ContextSnapshot {
        ContextSnapshot {
            symbol: "BTC".to_string(),
            ts,
            open_interest_usd: oi,
            previous_oi_usd: oi,
            oi_change_pct: 0.0,
            funding_rate: funding,
            source_exchange: "aggregated".to_string(),
        }
    }

    #[test]
    fn test_base_symbol_mapping() {
        assert_eq!(to_base_symbol("BTCUSDT"), "BTC");
        assert_eq!(to_base_symbol("1000PEPEUSDT"), "1000PEPE");
        assert_eq!(to_base_symbol("ETHUSD"), "ETH");
        assert_eq!(to_base_symbol("WEIRD"), "WEIRD");
    }

    #[test]
    fn test_ring_eviction() {
        let buffer = ContextBuffer::new(3);
        for i in 0..5 {
            buffer.add_snapshot(snap(i * 300_000, 1e9, 0.0001));
        }
        let stats = buffer.get_stats();
        assert_eq!(stats.total_snapshots, 3);
        assert_eq!(buffer.latest("BTC").unwrap().ts, 4 * 300_000);
    }

    #[test]
    fn test_oi_change_with_exact_bracket() {
        let buffer = ContextBuffer::new(72);
        let now = 10 * 3_600_000;
        // 1h ago exactly between two snapshots: 1.0B at -1h15m, 1.1B at -45m
        buffer.add_snapshot(snap(now - 4_500_000, 1.0e9, 0.0001));
        buffer.add_snapshot(snap(now - 2_700_000, 1.1e9, 0.0001));
        buffer.add_snapshot(snap(now - 60_000, 1.2e9, 0.0001));

        // Interpolated OI at -1h = 1.0e9 + (1.1e9-1.0e9) * (900/1800) = 1.05e9
        let change = buffer.oi_change_1h_pct("BTC", now, 600_000).unwrap();
        let expected = (1.2e9 - 1.05e9) / 1.05e9 * 100.0;
        assert!((change - expected).abs() < 1e-9);
    }

    #[test]
    fn test_oi_change_nearest_within_tolerance() {
        let buffer = ContextBuffer::new(72);
        let now = 10 * 3_600_000;
        // Only snapshots after the 1h-ago mark; nearest is 5 min late
        buffer.add_snapshot(snap(now - 3_300_000, 1.0e9, 0.0001));
        buffer.add_snapshot(snap(now - 60_000, 1.08e9, 0.0001));

        let change = buffer.oi_change_1h_pct("BTC", now, 600_000).unwrap();
        assert!((change - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_oi_change_insufficient_data() {
        let buffer = ContextBuffer::new(72);
        assert!(buffer.oi_change_1h_pct("BTC", 0, 600_000).is_none());

        // Single snapshot far from the 1h-ago target
        buffer.add_snapshot(snap(10 * 3_600_000 - 10_000, 1.0e9, 0.0001));
        assert!(buffer.oi_change_1h_pct("BTC", 10 * 3_600_000, 600_000).is_none());
    }
}
