// Confidence Scorer - adaptive scoring with a closed feedback loop
// Producer win rates learned from outcomes bias future confidence.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::core::types::{Priority, Producer, Tier, TradingSignal};

const BIAS_MIN_DECIDED: u64 = 20;

// ============================================================================
// Persisted State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinLoss {
    pub wins: u64,
    pub losses: u64,
}

impl WinLoss {
    pub fn decided(&self) -> u64 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        let decided = self.decided();
        if decided == 0 {
            0.5
        } else {
            self.wins as f64 / decided as f64
        }
    }
}

/// Serializable scorer state. BTreeMap keeps the JSON byte-stable across
/// persist/restore cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceState {
    pub per_producer: BTreeMap<String, WinLoss>,
}

// ============================================================================
// Scorer
// ============================================================================

/// Applies producer bias and tier bias on top of merger confidence, then
/// clamps and assigns priority. All state mutation goes through one mutex.
pub struct ConfidenceScorer {
    min_confidence: f64,
    state: Mutex<ConfidenceState>,
}

impl ConfidenceScorer {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            state: Mutex::new(ConfidenceState::default()),
        }
    }

    /// Adjust a signal's confidence in place. Returns false when the final
    /// confidence falls below the delivery floor.
    pub fn score(&self, signal: &mut TradingSignal) -> bool {
        let producer = signal.kind.producer();
        let bias = self.producer_bias(producer);
        let tier_bias = match signal.tier {
            Tier::T1 => 0.0,
            Tier::T2 => 2.0,
            Tier::T3 => 4.0,
        };

        signal.confidence = (signal.confidence + bias + tier_bias).clamp(0.0, 100.0);
        signal.priority = Priority::from_confidence(signal.confidence);

        debug!(
            symbol = %signal.symbol,
            producer = %producer,
            bias = bias,
            tier_bias = tier_bias,
            confidence = signal.confidence,
            "Signal scored"
        );

        signal.confidence >= self.min_confidence
    }

    /// Producer bias: `20·win_rate − 10` clamped to ±10, applied only once
    /// at least 20 outcomes have been decided for the producer.
    fn producer_bias(&self, producer: Producer) -> f64 {
        let state = self.state.lock();
        match state.per_producer.get(&producer.to_string()) {
            Some(record) if record.decided() >= BIAS_MIN_DECIDED => {
                (20.0 * record.win_rate() - 10.0).clamp(-10.0, 10.0)
            }
            _ => 0.0,
        }
    }

    /// Feed one decided outcome back into the producer's record.
    pub fn record_outcome(&self, producer: Producer, win: bool) {
        let mut state = self.state.lock();
        let record = state.per_producer.entry(producer.to_string()).or_default();
        if win {
            record.wins += 1;
        } else {
            record.losses += 1;
        }
        info!(
            producer = %producer,
            wins = record.wins,
            losses = record.losses,
            "Outcome recorded"
        );
    }

    pub fn producer_record(&self, producer: Producer) -> WinLoss {
        self.state
            .lock()
            .per_producer
            .get(&producer.to_string())
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ConfidenceState {
        self.state.lock().clone()
    }

    pub fn restore(&self, state: ConfidenceState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, SignalKind};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn signal(kind: SignalKind, tier: Tier, confidence: f64) -> TradingSignal {
        TradingSignal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            kind,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95520),
            target: dec!(96960),
            confidence,
            tier,
            priority: Priority::from_confidence(confidence),
            context: None,
            sources: vec![kind.producer()],
            metadata: serde_json::Value::Null,
            ts: 0,
        }
    }

    #[test]
    fn test_tier_bias_applied() {
        let scorer = ConfidenceScorer::new(70.0);

        let mut t1 = signal(SignalKind::StopHunt, Tier::T1, 80.0);
        let mut t2 = signal(SignalKind::StopHunt, Tier::T2, 80.0);
        let mut t3 = signal(SignalKind::StopHunt, Tier::T3, 80.0);
        scorer.score(&mut t1);
        scorer.score(&mut t2);
        scorer.score(&mut t3);

        assert!((t1.confidence - 80.0).abs() < 1e-9);
        assert!((t2.confidence - 82.0).abs() < 1e-9);
        assert!((t3.confidence - 84.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_bias_before_floor() {
        let scorer = ConfidenceScorer::new(70.0);

        // 19 decided outcomes: bias stays 0 regardless of win rate
        for _ in 0..19 {
            scorer.record_outcome(Producer::StopHunt, true);
        }
        let mut s = signal(SignalKind::StopHunt, Tier::T1, 80.0);
        scorer.score(&mut s);
        assert!((s.confidence - 80.0).abs() < 1e-9);

        // The 20th unlocks it: win_rate 1.0 -> +10
        scorer.record_outcome(Producer::StopHunt, true);
        let mut s = signal(SignalKind::StopHunt, Tier::T1, 80.0);
        scorer.score(&mut s);
        assert!((s.confidence - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_losing_producer_penalised() {
        let scorer = ConfidenceScorer::new(70.0);

        // 5 wins, 15 losses: win_rate 0.25 -> bias -5
        for _ in 0..5 {
            scorer.record_outcome(Producer::OrderFlow, true);
        }
        for _ in 0..15 {
            scorer.record_outcome(Producer::OrderFlow, false);
        }

        let mut s = signal(SignalKind::Accumulation, Tier::T1, 80.0);
        scorer.score(&mut s);
        assert!((s.confidence - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_and_priority() {
        let scorer = ConfidenceScorer::new(70.0);

        let mut s = signal(SignalKind::StopHunt, Tier::T3, 99.0);
        assert!(scorer.score(&mut s));
        assert!((s.confidence - 100.0).abs() < 1e-9);
        assert_eq!(s.priority, Priority::Urgent);

        let mut low = signal(SignalKind::StopHunt, Tier::T1, 50.0);
        assert!(!scorer.score(&mut low));
        assert_eq!(low.priority, Priority::Info);
    }

    #[test]
    fn test_state_round_trip_reproduces_scoring() {
        let scorer = ConfidenceScorer::new(70.0);
        for _ in 0..14 {
            scorer.record_outcome(Producer::StopHunt, true);
        }
        for _ in 0..6 {
            scorer.record_outcome(Producer::StopHunt, false);
        }

        let state = scorer.snapshot();
        let json = serde_json::to_string(&state).unwrap();

        let restored = ConfidenceScorer::new(70.0);
        restored.restore(serde_json::from_str(&json).unwrap());

        // Identical adjustments after restore
        let mut a = signal(SignalKind::StopHunt, Tier::T2, 80.0);
        let mut b = signal(SignalKind::StopHunt, Tier::T2, 80.0);
        scorer.score(&mut a);
        restored.score(&mut b);
        assert_eq!(a.confidence, b.confidence);

        // And the serialized form itself is byte-stable
        assert_eq!(json, serde_json::to_string(&restored.snapshot()).unwrap());
    }
}
