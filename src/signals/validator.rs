// Anti-Spam Validator - dedup, cooldown and hourly rate cap
// Every drop is counted by reason; a drop is flow control, not an error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

use crate::core::config::SignalsConfig;
use crate::core::types::TradingSignal;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    Cooldown,
    RateLimited,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::Cooldown => write!(f, "cooldown"),
            DropReason::RateLimited => write!(f, "rate_limited"),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidatorStats {
    pub validated: u64,
    pub approved: u64,
    pub dropped_duplicate: u64,
    pub dropped_cooldown: u64,
    pub dropped_rate_limited: u64,
}

impl fmt::Display for ValidatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validator(validated={}, approved={}, dup={}, cooldown={}, rate={})",
            self.validated,
            self.approved,
            self.dropped_duplicate,
            self.dropped_cooldown,
            self.dropped_rate_limited
        )
    }
}

/// Guards the delivery path against near-identical repeats, per-symbol
/// bursts and global floods. All bookkeeping is O(1) amortised with
/// expiry pruning on each call.
pub struct SignalValidator {
    dedup_window_ms: i64,
    cooldown_ms: i64,
    max_signals_per_hour: usize,

    dedup: HashMap<String, i64>,     // fingerprint -> last emit ts
    cooldowns: HashMap<String, i64>, // symbol -> last emit ts
    emitted: VecDeque<i64>,          // emit timestamps inside the last hour
    stats: ValidatorStats,
}

impl SignalValidator {
    pub fn new(config: &SignalsConfig) -> Self {
        Self {
            dedup_window_ms: config.dedup_window_seconds as i64 * 1_000,
            cooldown_ms: config.cooldown_minutes as i64 * 60_000,
            max_signals_per_hour: config.max_signals_per_hour,
            dedup: HashMap::new(),
            cooldowns: HashMap::new(),
            emitted: VecDeque::new(),
            stats: ValidatorStats::default(),
        }
    }

    pub fn validate(&mut self, signal: &TradingSignal, now_ms: i64) -> Result<(), DropReason> {
        self.stats.validated += 1;
        self.prune(now_ms);

        let fingerprint = signal.fingerprint();
        if self.dedup.contains_key(&fingerprint) {
            self.stats.dropped_duplicate += 1;
            debug!(fingerprint = %fingerprint, "Signal dropped: duplicate");
            return Err(DropReason::Duplicate);
        }

        if self.cooldowns.contains_key(&signal.symbol) {
            self.stats.dropped_cooldown += 1;
            debug!(symbol = %signal.symbol, "Signal dropped: cooldown");
            return Err(DropReason::Cooldown);
        }

        if self.emitted.len() >= self.max_signals_per_hour {
            self.stats.dropped_rate_limited += 1;
            warn!(
                limit = self.max_signals_per_hour,
                "Signal dropped: rate limited"
            );
            return Err(DropReason::RateLimited);
        }

        self.dedup.insert(fingerprint, now_ms);
        self.cooldowns.insert(signal.symbol.clone(), now_ms);
        self.emitted.push_back(now_ms);
        self.stats.approved += 1;
        Ok(())
    }

    /// Signals remaining in the current hourly quota.
    pub fn remaining_quota(&mut self, now_ms: i64) -> usize {
        self.prune(now_ms);
        self.max_signals_per_hour.saturating_sub(self.emitted.len())
    }

    fn prune(&mut self, now_ms: i64) {
        let dedup_cutoff = now_ms - self.dedup_window_ms;
        self.dedup.retain(|_, ts| *ts > dedup_cutoff);

        let cooldown_cutoff = now_ms - self.cooldown_ms;
        self.cooldowns.retain(|_, ts| *ts > cooldown_cutoff);

        while self.emitted.front().map(|ts| now_ms - ts >= HOUR_MS).unwrap_or(false) {
            self.emitted.pop_front();
        }
    }

    pub fn get_stats(&self) -> ValidatorStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, Priority, Producer, SignalKind, Tier};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn signal(symbol: &str, confidence: f64) -> TradingSignal {
        TradingSignal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            kind: SignalKind::Accumulation,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95520),
            target: dec!(96960),
            confidence,
            tier: Tier::T1,
            priority: Priority::from_confidence(confidence),
            context: None,
            sources: vec![Producer::OrderFlow],
            metadata: serde_json::Value::Null,
            ts: 0,
        }
    }

    fn validator() -> SignalValidator {
        SignalValidator::new(&SignalsConfig::default())
    }

    #[test]
    fn test_duplicate_within_window_dropped() {
        let mut v = validator();
        let s = signal("BTCUSDT", 75.0);

        assert!(v.validate(&s, 0).is_ok());
        assert_eq!(v.validate(&s, 100_000), Err(DropReason::Duplicate));

        // Past the 5-minute dedup window (and past cooldown) it passes again
        assert!(v.validate(&s, 301_000).is_ok());
    }

    #[test]
    fn test_cooldown_blocks_same_symbol_different_fingerprint() {
        let mut v = validator();

        assert!(v.validate(&signal("BTCUSDT", 75.0), 0).is_ok());
        // Different confidence band -> different fingerprint, still cooled down
        assert_eq!(
            v.validate(&signal("BTCUSDT", 95.0), 60_000),
            Err(DropReason::Cooldown)
        );
        // Another symbol is unaffected
        assert!(v.validate(&signal("ETHUSDT", 95.0), 60_000).is_ok());
    }

    #[test]
    fn test_hourly_rate_cap() {
        let config = SignalsConfig {
            max_signals_per_hour: 50,
            ..SignalsConfig::default()
        };
        let mut v = SignalValidator::new(&config);

        // 60 qualifying signals across 10 symbols in 55 minutes: the cap
        // admits exactly 50 and rejects 10 with reason rate_limited
        let mut approved = 0;
        let mut rate_limited = 0;
        for i in 0..60i64 {
            let symbol = format!("SYM{}USDT", i % 10);
            // Spread confidences so fingerprints and cooldowns never collide
            let mut s = signal(&symbol, 70.0 + (i as f64));
            s.symbol = format!("SYM{}_{}USDT", i % 10, i);
            match v.validate(&s, i * 55_000) {
                Ok(()) => approved += 1,
                Err(DropReason::RateLimited) => rate_limited += 1,
                Err(other) => panic!("unexpected drop: {}", other),
            }
        }

        assert_eq!(approved, 50);
        assert_eq!(rate_limited, 10);
        assert_eq!(v.get_stats().dropped_rate_limited, 10);
        assert_eq!(v.remaining_quota(60 * 55_000), 0);
    }

    #[test]
    fn test_quota_recovers_after_an_hour() {
        let config = SignalsConfig {
            max_signals_per_hour: 2,
            cooldown_minutes: 1,
            dedup_window_seconds: 60,
            ..SignalsConfig::default()
        };
        let mut v = SignalValidator::new(&config);

        assert!(v.validate(&signal("AUSDT", 75.0), 0).is_ok());
        assert!(v.validate(&signal("BUSDT", 75.0), 1_000).is_ok());
        assert_eq!(
            v.validate(&signal("CUSDT", 75.0), 2_000),
            Err(DropReason::RateLimited)
        );

        // An hour after the first emit, one slot frees up
        assert!(v.validate(&signal("CUSDT", 75.0), HOUR_MS + 1).is_ok());
    }

    #[test]
    fn test_replayed_event_is_idempotent() {
        let mut v = validator();
        let s = signal("BTCUSDT", 75.0);

        assert!(v.validate(&s, 0).is_ok());
        // Replaying the identical signal produces no second delivery
        assert!(v.validate(&s, 1_000).is_err());
        assert_eq!(v.get_stats().approved, 1);
    }
}
