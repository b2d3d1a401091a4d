// Event Pattern Detector - whale windows and volume spikes
// Complements the directional analyzers with activity-shaped patterns

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;

use crate::core::config::MonitoringConfig;
use crate::core::types::{Candidate, Direction, OrderSide, Producer, SignalKind};
use crate::layer2::baseline::VolumeBaseline;
use crate::layer2::buffers::BufferManager;

const WHALE_WINDOW_MS: i64 = 300_000;
const SPIKE_WINDOW_MS: i64 = 60_000;
const WHALE_DOMINANCE: f64 = 0.6;
const SPIKE_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EventPatternStats {
    pub whale_windows_detected: u64,
    pub volume_spikes_detected: u64,
    pub below_activity_floor: u64,
}

/// Runs the whale-window and volume-spike sub-detectors on the shared
/// analyzer cadence. Both apply a tier-aware activity floor so illiquid
/// symbols do not generate noise.
pub struct EventPatternDetector {
    monitoring: MonitoringConfig,
    stats: EventPatternStats,
}

impl EventPatternDetector {
    pub fn new(monitoring: MonitoringConfig) -> Self {
        Self {
            monitoring,
            stats: EventPatternStats::default(),
        }
    }

    /// Run all sub-detectors; zero, one or two candidates per invocation.
    pub fn analyze(
        &mut self,
        buffers: &BufferManager,
        baseline: &VolumeBaseline,
        symbol: &str,
        now_ms: i64,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        if let Some(c) = self.detect_whale_window(buffers, symbol, now_ms) {
            candidates.push(c);
        }
        if let Some(c) = self.detect_volume_spike(buffers, baseline, symbol, now_ms) {
            candidates.push(c);
        }

        candidates
    }

    /// Whale accumulation/distribution: a cluster of large orders within
    /// 5 minutes where one side holds at least 60% of the count.
    fn detect_whale_window(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        let trades = buffers.snapshot_trades(symbol, now_ms - WHALE_WINDOW_MS);
        if trades.len() < 20 {
            return None;
        }

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
        let total_large = large_buys + large_sells;

        if total_large < self.monitoring.whale_min_orders as usize {
            return None;
        }

        let (kind, direction, dominant) = if large_buys >= large_sells {
            (SignalKind::WhaleAccumulation, Direction::Long, large_buys)
        } else {
            (SignalKind::WhaleDistribution, Direction::Short, large_sells)
        };

        let share = dominant as f64 / total_large as f64;
        if share < WHALE_DOMINANCE {
            return None;
        }

        let raw_score = 50.0 + share * 40.0;

        self.stats.whale_windows_detected += 1;
        info!(
            symbol = symbol,
            kind = %kind,
            large_buys = large_buys,
            large_sells = large_sells,
            "Whale window detected"
        );

        Some(Candidate {
            producer: Producer::EventPattern,
            kind,
            symbol: symbol.to_string(),
            direction,
            raw_score,
            zone: None,
            levels: None,
            metadata: json!({
                "large_buys": large_buys,
                "large_sells": large_sells,
                "dominant_share": share,
                "window_secs": WHALE_WINDOW_MS / 1_000,
            }),
            ts: now_ms,
        })
    }

    /// Volume spike: the last minute's notional against the 24h per-minute
    /// baseline, `v_now ≥ max(3μ, μ + 3σ)`. Directionless.
    fn detect_volume_spike(
        &mut self,
        buffers: &BufferManager,
        baseline: &VolumeBaseline,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        let (mean, stddev) = baseline.baseline(symbol, now_ms)?;
        if mean <= 0.0 {
            return None;
        }

        let v_now: Decimal = buffers
            .snapshot_trades(symbol, now_ms - SPIKE_WINDOW_MS)
            .iter()
            .map(|t| t.notional_usd)
            .sum();
        let v_now = v_now.to_f64().unwrap_or(0.0);

        // Activity floor keeps illiquid symbols quiet
        let tier = self.monitoring.tier_of(symbol);
        let floor = self
            .monitoring
            .cascade_threshold(tier)
            .to_f64()
            .unwrap_or(f64::MAX)
            / 10.0;
        if v_now < floor {
            self.stats.below_activity_floor += 1;
            return None;
        }

        let gate = (SPIKE_MULTIPLIER * mean).max(mean + 3.0 * stddev);
        if v_now < gate {
            return None;
        }

        let spike_ratio = v_now / mean;
        let raw_score = (50.0 + 10.0 * spike_ratio).min(99.0);

        self.stats.volume_spikes_detected += 1;
        info!(
            symbol = symbol,
            spike_ratio = format!("{:.1}x", spike_ratio),
            v_now = format!("{:.0}", v_now),
            mean = format!("{:.0}", mean),
            "Volume spike detected"
        );

        Some(Candidate {
            producer: Producer::EventPattern,
            kind: SignalKind::VolumeSpike,
            symbol: symbol.to_string(),
            direction: Direction::Neutral,
            raw_score,
            zone: None,
            levels: None,
            metadata: json!({
                "v_now": v_now,
                "baseline_mean": mean,
                "baseline_stddev": stddev,
                "spike_ratio": spike_ratio,
            }),
            ts: now_ms,
        })
    }

    pub fn get_stats(&self) -> EventPatternStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Trade;
    use rust_decimal_macros::dec;

    fn buffers() -> BufferManager {
        BufferManager::new(1_000, 500, 3_600_000, 2_000)
    }

    fn detector() -> EventPatternDetector {
        EventPatternDetector::new(MonitoringConfig::default())
    }

    fn trade(ts: i64, side: OrderSide, notional: Decimal) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            exchange: "Binance".to_string(),
            price: dec!(96000),
            side,
            notional_usd: notional,
            ts,
        }
    }

    #[test]
    fn test_whale_accumulation_window() {
        let b = buffers();
        let base = VolumeBaseline::new();
        let mut d = detector();

        // 8 large buys, 2 large sells, plus filler to clear the 20-trade floor
        for i in 0..8 {
            b.append_trade(trade(i * 1_000, OrderSide::Buy, dec!(25000)));
        }
        for i in 0..2 {
            b.append_trade(trade(8_000 + i * 1_000, OrderSide::Sell, dec!(25000)));
        }
        for i in 0..15 {
            b.append_trade(trade(10_000 + i * 500, OrderSide::Buy, dec!(500)));
        }

        let candidates = d.analyze(&b, &base, "BTCUSDT", 20_000);
        assert_eq!(candidates.len(), 1);
        let whale = &candidates[0];
        assert_eq!(whale.kind, SignalKind::WhaleAccumulation);
        assert_eq!(whale.direction, Direction::Long);
        // share = 0.8 -> 50 + 32 = 82
        assert!((whale.raw_score - 82.0).abs() < 0.01);
    }

    #[test]
    fn test_whale_window_needs_dominance() {
        let b = buffers();
        let base = VolumeBaseline::new();
        let mut d = detector();

        // 5 vs 5: no dominant side
        for i in 0..5 {
            b.append_trade(trade(i * 1_000, OrderSide::Buy, dec!(25000)));
            b.append_trade(trade(i * 1_000 + 500, OrderSide::Sell, dec!(25000)));
        }
        for i in 0..15 {
            b.append_trade(trade(6_000 + i * 500, OrderSide::Buy, dec!(500)));
        }

        assert!(d.analyze(&b, &base, "BTCUSDT", 20_000).is_empty());
    }

    #[test]
    fn test_volume_spike_against_baseline() {
        let b = buffers();
        let base = VolumeBaseline::new();
        let mut d = detector();

        // Quiet baseline: $300K per minute for 30 closed minutes
        for m in 0..30i64 {
            base.observe("BTCUSDT", m * 60_000, dec!(300000));
        }

        let now = 30 * 60_000 + 30_000;
        // $1.2M inside the last minute: 4x the mean
        for i in 0..12 {
            b.append_trade(trade(now - 50_000 + i * 4_000, OrderSide::Buy, dec!(100000)));
        }

        let candidates = d.analyze(&b, &base, "BTCUSDT", now);
        let spike = candidates
            .iter()
            .find(|c| c.kind == SignalKind::VolumeSpike)
            .expect("spike candidate");
        assert_eq!(spike.direction, Direction::Neutral);
        // ratio 4.0 -> score 90
        assert!((spike.raw_score - 90.0).abs() < 0.5);
    }

    #[test]
    fn test_spike_below_multiplier_not_emitted() {
        let b = buffers();
        let base = VolumeBaseline::new();
        let mut d = detector();

        for m in 0..30i64 {
            base.observe("BTCUSDT", m * 60_000, dec!(300000));
        }

        let now = 30 * 60_000 + 30_000;
        // Only 2x the mean: under the 3x gate
        for i in 0..6 {
            b.append_trade(trade(now - 50_000 + i * 8_000, OrderSide::Buy, dec!(100000)));
        }

        assert!(d.analyze(&b, &base, "BTCUSDT", now).is_empty());
    }

    #[test]
    fn test_activity_floor_blocks_illiquid_spike() {
        let b = buffers();
        let base = VolumeBaseline::new();
        let mut d = detector();

        // Tiny tier-3 symbol with a relative spike that is still below
        // tier3_cascade/10 = $5K absolute
        for m in 0..30i64 {
            base.observe("DUSTUSDT", m * 60_000, dec!(100));
        }
        let now = 30 * 60_000 + 30_000;
        b.append_trade(Trade {
            symbol: "DUSTUSDT".to_string(),
            exchange: "Binance".to_string(),
            price: dec!(0.001),
            side: OrderSide::Buy,
            notional_usd: dec!(1000),
            ts: now - 10_000,
        });

        assert!(d.analyze(&b, &base, "DUSTUSDT", now).is_empty());
        assert_eq!(d.get_stats().below_activity_floor, 1);
    }
}
