// Signal Merger - coalesces near-simultaneous analyzer candidates
// One market event often trips several analyzers; a short window folds
// them into a single TradingSignal per symbol.

use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::MonitoringConfig;
use crate::core::types::{
    Candidate, Direction, Priority, SignalKind, TradeLevels, TradingSignal,
};
use crate::layer2::buffers::BufferManager;

const FALLBACK_ZONE_WINDOW_MS: i64 = 60_000;
const FALLBACK_STOP_PCT: &str = "0.005";
const CONCURRENCE_BONUS: f64 = 5.0;

#[derive(Debug)]
struct PendingGroup {
    opened_at: i64,
    candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MergerStats {
    pub candidates_received: u64,
    pub signals_produced: u64,
    pub dropped_no_price: u64,
}

/// Groups candidates per symbol inside a coalescing window, then emits
/// one TradingSignal. The window length is a knob, not a contract.
pub struct SignalMerger {
    monitoring: MonitoringConfig,
    coalesce_window_ms: i64,
    pending: HashMap<String, PendingGroup>,
    stats: MergerStats,
}

impl SignalMerger {
    pub fn new(monitoring: MonitoringConfig, coalesce_window_ms: i64) -> Self {
        Self {
            monitoring,
            coalesce_window_ms,
            pending: HashMap::new(),
            stats: MergerStats::default(),
        }
    }

    pub fn add(&mut self, candidate: Candidate, now_ms: i64) {
        self.stats.candidates_received += 1;
        debug!(symbol = %candidate.symbol, kind = %candidate.kind, "Candidate queued");

        self.pending
            .entry(candidate.symbol.clone())
            .or_insert_with(|| PendingGroup {
                opened_at: now_ms,
                candidates: Vec::new(),
            })
            .candidates
            .push(candidate);
    }

    /// Flush groups whose window has closed. Signal emission order follows
    /// group-open order per symbol; symbols never reorder each other.
    pub fn poll_ready(&mut self, buffers: &BufferManager, now_ms: i64) -> Vec<TradingSignal> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, group)| now_ms - group.opened_at >= self.coalesce_window_ms)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        let mut signals = Vec::new();
        for symbol in due {
            if let Some(group) = self.pending.remove(&symbol) {
                if let Some(signal) = self.build_signal(buffers, &symbol, group.candidates, now_ms)
                {
                    signals.push(signal);
                }
            }
        }
        signals.sort_by_key(|s| s.ts);
        signals
    }

    fn build_signal(
        &mut self,
        buffers: &BufferManager,
        symbol: &str,
        candidates: Vec<Candidate>,
        now_ms: i64,
    ) -> Option<TradingSignal> {
        if candidates.is_empty() {
            return None;
        }

        // Highest-priority candidate decides kind and breaks direction ties
        let lead = candidates
            .iter()
            .min_by(|a, b| {
                a.kind
                    .rank()
                    .cmp(&b.kind.rank())
                    .then(b.raw_score.partial_cmp(&a.raw_score).unwrap_or(std::cmp::Ordering::Equal))
            })?
            .clone();

        let direction = merge_direction(&candidates, &lead);

        let levels = match candidates.iter().find_map(|c| c.levels) {
            Some(levels) => levels,
            None => match fallback_levels(buffers, symbol, direction, now_ms) {
                Some(levels) => levels,
                None => {
                    self.stats.dropped_no_price += 1;
                    debug!(symbol = symbol, "No price reference for signal levels");
                    return None;
                }
            },
        };

        let mut sources: Vec<_> = candidates.iter().map(|c| c.producer).collect();
        sources.sort();
        sources.dedup();

        let best_score = candidates
            .iter()
            .map(|c| c.raw_score)
            .fold(f64::MIN, f64::max);
        let confidence = if sources.len() >= 2 {
            best_score + CONCURRENCE_BONUS
        } else {
            best_score
        };

        let tier = self.monitoring.tier_of(symbol);
        let metadata = json!({
            "candidates": candidates
                .iter()
                .map(|c| json!({
                    "producer": c.producer,
                    "kind": c.kind.to_string(),
                    "raw_score": c.raw_score,
                    "details": c.metadata,
                }))
                .collect::<Vec<_>>(),
        });

        self.stats.signals_produced += 1;
        let signal = TradingSignal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            kind: lead.kind,
            direction,
            entry: levels.entry,
            stop: levels.stop,
            target: levels.target,
            confidence,
            tier,
            priority: Priority::from_confidence(confidence),
            context: None,
            sources,
            metadata,
            ts: now_ms,
        };
        info!(signal = %signal, "Signal merged");
        Some(signal)
    }

    pub fn pending_symbols(&self) -> usize {
        self.pending.len()
    }

    pub fn get_stats(&self) -> MergerStats {
        self.stats.clone()
    }
}

/// Majority vote over candidate directions. A tie, or any directionless
/// candidate, defers to the lead candidate.
fn merge_direction(candidates: &[Candidate], lead: &Candidate) -> Direction {
    if candidates.iter().any(|c| c.direction == Direction::Neutral) {
        return lead.direction;
    }
    let longs = candidates.iter().filter(|c| c.direction == Direction::Long).count();
    let shorts = candidates.len() - longs;
    match longs.cmp(&shorts) {
        std::cmp::Ordering::Greater => Direction::Long,
        std::cmp::Ordering::Less => Direction::Short,
        std::cmp::Ordering::Equal => lead.direction,
    }
}

/// Without a stop-hunt zone, anchor levels to the most recent minute of
/// trades: entry at the last price, stop 0.5% away, target at 2:1.
fn fallback_levels(
    buffers: &BufferManager,
    symbol: &str,
    direction: Direction,
    now_ms: i64,
) -> Option<TradeLevels> {
    let trades = buffers.snapshot_trades(symbol, now_ms - FALLBACK_ZONE_WINDOW_MS);
    let entry = trades.last().map(|t| t.price)?;
    let stop_pct: rust_decimal::Decimal = FALLBACK_STOP_PCT.parse().ok()?;

    let levels = match direction {
        Direction::Short => {
            let stop = entry + entry * stop_pct;
            let target = entry - dec!(2) * (stop - entry);
            TradeLevels { entry, stop, target }
        }
        _ => {
            let stop = entry - entry * stop_pct;
            let target = entry + dec!(2) * (entry - stop);
            TradeLevels { entry, stop, target }
        }
    };
    Some(levels)
}
