// Volume Baseline - rolling per-minute notional statistics per symbol
// Feeds the volume-spike detector with a 24h mean/stddev reference

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const MINUTE_MS: i64 = 60_000;
const WINDOW_MINUTES: usize = 1_440; // 24 hours

/// One minute bucket of traded notional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MinuteBucket {
    minute: i64, // ts / 60_000
    notional: f64,
}

#[derive(Default)]
struct SymbolBaseline {
    buckets: VecDeque<MinuteBucket>,
}

impl SymbolBaseline {
    fn observe(&mut self, minute: i64, notional: f64) {
        match self.buckets.back_mut() {
            Some(bucket) if bucket.minute == minute => bucket.notional += notional,
            Some(bucket) if bucket.minute > minute => {
                // Late trade for an already-closed minute
                if let Some(b) = self.buckets.iter_mut().rev().find(|b| b.minute == minute) {
                    b.notional += notional;
                }
            }
            _ => {
                self.buckets.push_back(MinuteBucket { minute, notional });
                if self.buckets.len() > WINDOW_MINUTES + 1 {
                    self.buckets.pop_front();
                }
            }
        }
    }

    /// Mean and stddev over closed minutes, excluding the current minute
    /// so a spike in progress does not dilute its own baseline.
    fn stats_excluding(&self, current_minute: i64) -> Option<(f64, f64)> {
        let cutoff = current_minute - WINDOW_MINUTES as i64;
        let values: Vec<f64> = self
            .buckets
            .iter()
            .filter(|b| b.minute < current_minute && b.minute >= cutoff)
            .map(|b| b.notional)
            .collect();

        if values.len() < 5 {
            return None; // Not enough history for a meaningful baseline
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some((mean, variance.sqrt()))
    }
}

/// Per-symbol rolling baseline of per-minute traded notional.
pub struct VolumeBaseline {
    symbols: RwLock<HashMap<String, SymbolBaseline>>,
}

impl VolumeBaseline {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Record a trade's notional into its minute bucket.
    pub fn observe(&self, symbol: &str, ts: i64, notional: Decimal) {
        let notional = notional.to_f64().unwrap_or(0.0);
        let minute = ts / MINUTE_MS;
        let mut symbols = self.symbols.write();
        symbols.entry(symbol.to_string()).or_default().observe(minute, notional);
    }

    /// (mean, stddev) of per-minute notional over the preceding 24h,
    /// excluding the minute containing now_ms. None until enough history.
    pub fn baseline(&self, symbol: &str, now_ms: i64) -> Option<(f64, f64)> {
        let current_minute = now_ms / MINUTE_MS;
        self.symbols
            .read()
            .get(symbol)
            .and_then(|b| b.stats_excluding(current_minute))
    }

    pub fn tracked_symbols(&self) -> usize {
        self.symbols.read().len()
    }
}

impl Default for VolumeBaseline {
    fn default() -> Self {
        Self::new()
    }
}
