// Stop-Hunt Detector - liquidation cascades with absorption analysis
// A cascade is a 30s cluster of one-sided forced closures; absorption is
// aggressive opposite-side flow in the 30s that follows.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::core::config::MonitoringConfig;
use crate::core::types::{
    Candidate, Direction, LiquidationSide, OrderSide, PriceZone, Producer, SignalKind,
    TradeLevels,
};
use crate::layer2::buffers::BufferManager;

const CASCADE_WINDOW_MS: i64 = 30_000;
const ABSORPTION_WINDOW_MS: i64 = 30_000;

/// A cascade that crossed the volume threshold and is waiting for its
/// absorption window to complete (or to fill early).
#[derive(Debug, Clone)]
struct PendingCascade {
    window_start: i64,
    cascade_end: i64,
    total_volume: Decimal,
    dominant_side: LiquidationSide,
    dominance: f64,
    liquidation_count: usize,
    zone: PriceZone,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StopHuntStats {
    pub cascades_detected: u64,
    pub candidates_emitted: u64,
    pub absorption_confirmed: u64,
    pub errors: u64,
}

/// Detects liquidation cascades and scores the reversal setup.
///
/// Invoked on every liquidation append for a symbol, then re-polled on
/// the analyzer cadence until the absorption window resolves.
pub struct StopHuntDetector {
    monitoring: MonitoringConfig,
    pending: HashMap<String, PendingCascade>,
    stats: StopHuntStats,
}

impl StopHuntDetector {
    pub fn new(monitoring: MonitoringConfig) -> Self {
        Self {
            monitoring,
            pending: HashMap::new(),
            stats: StopHuntStats::default(),
        }
    }

    /// Check a symbol for a cascade and, once the absorption window has
    /// resolved, emit a candidate. Returns None while no cascade is active
    /// or while absorption is still pending.
    pub fn check(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        if !self.pending.contains_key(symbol) {
            self.scan_for_cascade(buffers, symbol, now_ms);
        } else {
            self.refresh_pending(buffers, symbol);
        }

        self.resolve_absorption(buffers, symbol, now_ms)
    }

    /// Look for a fresh cascade in the last 30s. Strict greater-than:
    /// a sum exactly at the threshold does not trigger.
    fn scan_for_cascade(&mut self, buffers: &BufferManager, symbol: &str, now_ms: i64) {
        let window_start = now_ms - CASCADE_WINDOW_MS;
        let liquidations = buffers.snapshot_liquidations(symbol, window_start);
        if liquidations.is_empty() {
            return;
        }

        let tier = self.monitoring.tier_of(symbol);
        let threshold = self.monitoring.cascade_threshold(tier);

        let total: Decimal = liquidations.iter().map(|l| l.notional_usd).sum();
        if total <= threshold {
            return;
        }

        let long_vol: Decimal = liquidations
            .iter()
            .filter(|l| l.side == LiquidationSide::LongLiquidated)
            .map(|l| l.notional_usd)
            .sum();
        let short_vol = total - long_vol;

        let (dominant_side, dominant_vol) = if long_vol >= short_vol {
            (LiquidationSide::LongLiquidated, long_vol)
        } else {
            (LiquidationSide::ShortLiquidated, short_vol)
        };
        let dominance = (dominant_vol / total).to_f64().unwrap_or(0.0);
        if dominance < 0.6 {
            debug!(symbol = symbol, dominance = dominance, "Cascade without dominant side");
            return;
        }

        let low = liquidations.iter().map(|l| l.price).min().unwrap_or(Decimal::ZERO);
        let high = liquidations.iter().map(|l| l.price).max().unwrap_or(Decimal::ZERO);
        let cascade_end = liquidations.iter().map(|l| l.ts).max().unwrap_or(now_ms);

        self.stats.cascades_detected += 1;
        info!(
            symbol = symbol,
            volume = %total,
            side = %dominant_side,
            dominance = format!("{:.0}%", dominance * 100.0),
            "Liquidation cascade detected"
        );

        self.pending.insert(
            symbol.to_string(),
            PendingCascade {
                window_start,
                cascade_end,
                total_volume: total,
                dominant_side,
                dominance,
                liquidation_count: liquidations.len(),
                zone: PriceZone { low, high },
            },
        );
    }

    /// While the cascade is still receiving liquidations, fold them in.
    fn refresh_pending(&mut self, buffers: &BufferManager, symbol: &str) {
        let Some(pending) = self.pending.get_mut(symbol) else {
            return;
        };
        let liquidations = buffers.snapshot_liquidations(symbol, pending.window_start);
        if liquidations.is_empty() {
            return;
        }

        let total: Decimal = liquidations.iter().map(|l| l.notional_usd).sum();
        if total <= pending.total_volume {
            return;
        }

        let long_vol: Decimal = liquidations
            .iter()
            .filter(|l| l.side == LiquidationSide::LongLiquidated)
            .map(|l| l.notional_usd)
            .sum();
        let short_vol = total - long_vol;
        let (dominant_side, dominant_vol) = if long_vol >= short_vol {
            (LiquidationSide::LongLiquidated, long_vol)
        } else {
            (LiquidationSide::ShortLiquidated, short_vol)
        };

        pending.total_volume = total;
        pending.dominant_side = dominant_side;
        pending.dominance = (dominant_vol / total).to_f64().unwrap_or(0.0);
        pending.liquidation_count = liquidations.len();
        pending.cascade_end = liquidations.iter().map(|l| l.ts).max().unwrap_or(pending.cascade_end);
        pending.zone.low = liquidations.iter().map(|l| l.price).min().unwrap_or(pending.zone.low);
        pending.zone.high = liquidations.iter().map(|l| l.price).max().unwrap_or(pending.zone.high);
    }

    /// Emit once absorption has either filled the tier threshold or the
    /// 30s post-cascade window has fully elapsed; defer otherwise.
    fn resolve_absorption(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        let pending = self.pending.get(symbol)?.clone();

        let tier = self.monitoring.tier_of(symbol);
        let absorption_threshold = self.monitoring.absorption_threshold(tier);
        let absorption_min = Decimal::from(self.monitoring.absorption_min_usd);

        // The whales taking the other side of the flush trade opposite
        // the liquidated positions: flushed longs are bought up, flushed
        // shorts are sold into.
        let absorption_side = match pending.dominant_side {
            LiquidationSide::LongLiquidated => OrderSide::Buy,
            LiquidationSide::ShortLiquidated => OrderSide::Sell,
        };

        let window_end = pending.cascade_end + ABSORPTION_WINDOW_MS;
        let absorption_volume: Decimal = buffers
            .snapshot_trades(symbol, pending.cascade_end)
            .iter()
            .filter(|t| t.ts <= window_end)
            .filter(|t| t.side == absorption_side && t.notional_usd >= absorption_min)
            .map(|t| t.notional_usd)
            .sum();

        let absorption = absorption_volume >= absorption_threshold;
        if !absorption && now_ms < window_end {
            // Cascade still in flight: wait for the full absorption window
            return None;
        }

        self.pending.remove(symbol);

        let direction = match pending.dominant_side {
            LiquidationSide::LongLiquidated => Direction::Long,
            LiquidationSide::ShortLiquidated => Direction::Short,
        };

        let threshold = self.monitoring.cascade_threshold(tier);
        let volume_ratio = (pending.total_volume / (threshold * dec!(3)))
            .to_f64()
            .unwrap_or(0.0)
            .min(1.0);
        let raw_score = 50.0
            + 20.0 * volume_ratio
            + 15.0 * pending.dominance
            + if absorption { 20.0 } else { 0.0 };

        let levels = levels_from_zone(&pending.zone, direction);

        self.stats.candidates_emitted += 1;
        if absorption {
            self.stats.absorption_confirmed += 1;
        }
        info!(
            symbol = symbol,
            direction = %direction,
            volume = %pending.total_volume,
            absorption = %absorption_volume,
            score = format!("{:.1}", raw_score),
            "Stop hunt candidate"
        );

        Some(Candidate {
            producer: Producer::StopHunt,
            kind: SignalKind::StopHunt,
            symbol: symbol.to_string(),
            direction,
            raw_score,
            zone: Some(pending.zone),
            levels: Some(levels),
            metadata: json!({
                "total_volume": pending.total_volume,
                "liquidation_count": pending.liquidation_count,
                "dominance": pending.dominance,
                "liquidated_side": pending.dominant_side,
                "absorption_detected": absorption,
                "absorption_volume": absorption_volume,
                "zone_low": pending.zone.low,
                "zone_high": pending.zone.high,
            }),
            ts: now_ms,
        })
    }

    pub fn get_stats(&self) -> StopHuntStats {
        self.stats.clone()
    }
}

/// Entry at the reversal edge of the hunt zone, stop 0.1% beyond the far
/// edge, target at 2:1 reward-to-risk. All on the decimal price grid.
pub fn levels_from_zone(zone: &PriceZone, direction: Direction) -> TradeLevels {
    let pad = dec!(0.001);
    match direction {
        Direction::Short => {
            let entry = zone.low;
            let stop = zone.high + entry * pad;
            let target = entry - dec!(2) * (stop - entry);
            TradeLevels { entry, stop, target }
        }
        _ => {
            let entry = zone.high;
            let stop = zone.low - entry * pad;
            let target = entry + dec!(2) * (entry - stop);
            TradeLevels { entry, stop, target }
        }
    }
}
