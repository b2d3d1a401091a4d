// Outcome Tracker - labels delivered signals WIN/LOSS/EXPIRED at a fixed
// horizon and closes the feedback loop into the confidence scorer.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::OutcomeConfig;
use crate::core::types::{Direction, OutcomeLabel, Producer, SignalOutcome, TradingSignal};
use crate::layer2::buffers::BufferManager;

const RETRY_DELAY_MS: i64 = 60_000;

#[derive(Debug, Clone)]
struct TrackedSignal {
    signal_id: Uuid,
    symbol: String,
    producer: Producer,
    direction: Direction,
    entry: Decimal,
    target: Decimal,
    check_after: i64,
    retried: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TrackerStats {
    pub pending: usize,
    pub wins: u64,
    pub losses: u64,
    pub expired: u64,
}

impl fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tracker(pending={}, wins={}, losses={}, expired={})",
            self.pending, self.wins, self.losses, self.expired
        )
    }
}

/// A decided outcome bundled with the producer to credit, so the caller
/// can persist and update scorer state in one step.
#[derive(Debug, Clone)]
pub struct DecidedOutcome {
    pub outcome: SignalOutcome,
    pub producer: Producer,
}

/// Holds delivered signals until their horizon elapses, then reads the
/// freshest trade price and labels progress toward the target.
pub struct OutcomeTracker {
    horizon_ms: i64,
    win_fraction: f64,
    staleness_ms: i64,
    pending: Vec<TrackedSignal>,
    stats: TrackerStats,
}

impl OutcomeTracker {
    pub fn new(config: &OutcomeConfig) -> Self {
        Self {
            horizon_ms: config.horizon_minutes as i64 * 60_000,
            win_fraction: config.win_fraction,
            staleness_ms: config.price_staleness_secs as i64 * 1_000,
            pending: Vec::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Start the horizon clock for a delivered signal.
    pub fn track(&mut self, signal: &TradingSignal) {
        self.pending.push(TrackedSignal {
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            producer: signal.kind.producer(),
            direction: signal.direction,
            entry: signal.entry,
            target: signal.target,
            check_after: signal.ts + self.horizon_ms,
            retried: false,
        });
        info!(
            signal_id = %signal.id,
            symbol = %signal.symbol,
            check_after = signal.ts + self.horizon_ms,
            "Tracking signal outcome"
        );
    }

    /// Evaluate every signal whose horizon has elapsed. A missing price is
    /// retried once a minute later, then labelled expired.
    pub fn due_checks(&mut self, buffers: &BufferManager, now_ms: i64) -> Vec<DecidedOutcome> {
        let mut decided = Vec::new();
        let mut still_pending = Vec::new();

        for mut tracked in std::mem::take(&mut self.pending) {
            if now_ms < tracked.check_after {
                still_pending.push(tracked);
                continue;
            }

            let price = buffers
                .last_trade(&tracked.symbol)
                .filter(|t| now_ms - t.ts <= self.staleness_ms)
                .map(|t| t.price);

            match price {
                Some(price) => {
                    decided.push(self.settle(&tracked, Some(price), now_ms));
                }
                None if !tracked.retried => {
                    tracked.retried = true;
                    tracked.check_after = now_ms + RETRY_DELAY_MS;
                    still_pending.push(tracked);
                }
                None => {
                    warn!(
                        signal_id = %tracked.signal_id,
                        symbol = %tracked.symbol,
                        "No recent price at horizon; outcome expired"
                    );
                    decided.push(self.settle(&tracked, None, now_ms));
                }
            }
        }

        self.pending = still_pending;
        self.stats.pending = self.pending.len();
        decided
    }

    fn settle(
        &mut self,
        tracked: &TrackedSignal,
        price: Option<Decimal>,
        now_ms: i64,
    ) -> DecidedOutcome {
        let (label, pct_to_target) = match price {
            None => (OutcomeLabel::Expired, 0.0),
            Some(price) => {
                let progress = progress_to_target(tracked.entry, tracked.target, price);
                if progress >= self.win_fraction {
                    (OutcomeLabel::Win, progress)
                } else {
                    (OutcomeLabel::Loss, progress)
                }
            }
        };

        match label {
            OutcomeLabel::Win => self.stats.wins += 1,
            OutcomeLabel::Loss => self.stats.losses += 1,
            OutcomeLabel::Expired => self.stats.expired += 1,
        }

        info!(
            signal_id = %tracked.signal_id,
            symbol = %tracked.symbol,
            label = %label,
            pct_to_target = format!("{:.2}", pct_to_target),
            "Signal outcome settled"
        );

        DecidedOutcome {
            outcome: SignalOutcome {
                signal_id: tracked.signal_id,
                ts: now_ms,
                entry_price: tracked.entry,
                price_at_check: price,
                pct_to_target,
                label,
            },
            producer: tracked.producer,
        }
    }

    pub fn get_stats(&self) -> TrackerStats {
        let mut stats = self.stats.clone();
        stats.pending = self.pending.len();
        stats
    }
}

/// Fraction of the entry→target distance covered by the current price.
/// `target − entry` carries the direction's sign, so the same expression
/// serves longs and shorts.
fn progress_to_target(entry: Decimal, target: Decimal, price: Decimal) -> f64 {
    let span = target - entry;
    if span.is_zero() {
        return 0.0;
    }
    ((price - entry) / span).to_f64().unwrap_or(0.0)
}
