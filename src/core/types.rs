// Core Type Definitions for Signal Hunt
// Canonical event and signal shapes shared by every layer

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Which positions were force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationSide {
    LongLiquidated,
    ShortLiquidated,
}

impl fmt::Display for LiquidationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiquidationSide::LongLiquidated => write!(f, "LONG_LIQ"),
            LiquidationSide::ShortLiquidated => write!(f, "SHORT_LIQ"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            _ => Err(format!("Invalid OrderSide: '{}'. Expected 'BUY' or 'SELL'", s)),
        }
    }
}

/// Liquidity classification of a symbol. Static per run, scales thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::T1 => write!(f, "T1"),
            Tier::T2 => write!(f, "T2"),
            Tier::T3 => write!(f, "T3"),
        }
    }
}

/// Analyzer that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Producer {
    StopHunt,
    OrderFlow,
    EventPattern,
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::StopHunt => write!(f, "stop_hunt"),
            Producer::OrderFlow => write!(f, "order_flow"),
            Producer::EventPattern => write!(f, "event_pattern"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    StopHunt,
    WhaleAccumulation,
    WhaleDistribution,
    Accumulation,
    Distribution,
    VolumeSpike,
}

impl SignalKind {
    /// Rank used by the merger when multiple analyzers concur.
    /// Lower is stronger: stop-hunt > whale > order-flow > volume-spike.
    pub fn rank(&self) -> u8 {
        match self {
            SignalKind::StopHunt => 0,
            SignalKind::WhaleAccumulation | SignalKind::WhaleDistribution => 1,
            SignalKind::Accumulation | SignalKind::Distribution => 2,
            SignalKind::VolumeSpike => 3,
        }
    }

    /// The analyzer this kind originates from; used for win-rate accounting.
    pub fn producer(&self) -> Producer {
        match self {
            SignalKind::StopHunt => Producer::StopHunt,
            SignalKind::Accumulation | SignalKind::Distribution => Producer::OrderFlow,
            SignalKind::WhaleAccumulation
            | SignalKind::WhaleDistribution
            | SignalKind::VolumeSpike => Producer::EventPattern,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::StopHunt => write!(f, "STOP_HUNT"),
            SignalKind::WhaleAccumulation => write!(f, "WHALE_ACCUMULATION"),
            SignalKind::WhaleDistribution => write!(f, "WHALE_DISTRIBUTION"),
            SignalKind::Accumulation => write!(f, "ACCUMULATION"),
            SignalKind::Distribution => write!(f, "DISTRIBUTION"),
            SignalKind::VolumeSpike => write!(f, "VOLUME_SPIKE"),
        }
    }
}

/// Delivery tier derived from final confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Urgent,
    Watch,
    Info,
}

impl Priority {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 85.0 {
            Priority::Urgent
        } else if confidence >= 70.0 {
            Priority::Watch
        } else {
            Priority::Info
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Urgent => write!(f, "URGENT"),
            Priority::Watch => write!(f, "WATCH"),
            Priority::Info => write!(f, "INFO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextAssessment {
    Favorable,
    Neutral,
    Unfavorable,
}

impl fmt::Display for ContextAssessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextAssessment::Favorable => write!(f, "FAVORABLE"),
            ContextAssessment::Neutral => write!(f, "NEUTRAL"),
            ContextAssessment::Unfavorable => write!(f, "UNFAVORABLE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeLabel {
    Win,
    Loss,
    Expired,
}

impl fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeLabel::Win => write!(f, "WIN"),
            OutcomeLabel::Loss => write!(f, "LOSS"),
            OutcomeLabel::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Liquidation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub side: LiquidationSide,
    pub notional_usd: Decimal,
    pub ts: i64, // milliseconds UTC
}

impl fmt::Display for Liquidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Liquidation(symbol={}, side={}, price={}, notional=${})",
            self.symbol, self.side, self.price, self.notional_usd
        )
    }
}

// ============================================================================
// Trade
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub side: OrderSide,
    pub notional_usd: Decimal,
    pub ts: i64, // milliseconds UTC
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade(symbol={}, side={}, price={}, notional=${})",
            self.symbol, self.side, self.price, self.notional_usd
        )
    }
}

// ============================================================================
// ContextSnapshot
// ============================================================================

/// One poll cycle result for a symbol: open interest and funding rate,
/// taken from the close of the most recent candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub symbol: String,
    pub ts: i64, // milliseconds UTC
    pub open_interest_usd: f64,
    pub previous_oi_usd: f64,
    pub oi_change_pct: f64,
    pub funding_rate: f64, // signed fraction, e.g. 0.0001 = +0.01%
    pub source_exchange: String,
}

impl fmt::Display for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContextSnapshot(symbol={}, oi=${:.0}, funding={:+.6})",
            self.symbol, self.open_interest_usd, self.funding_rate
        )
    }
}

// ============================================================================
// Candidate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceZone {
    pub low: Decimal,
    pub high: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
}

/// Ephemeral analyzer output; lives one pipeline step before merging.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub producer: Producer,
    pub kind: SignalKind,
    pub symbol: String,
    pub direction: Direction,
    pub raw_score: f64,
    pub zone: Option<PriceZone>,
    pub levels: Option<TradeLevels>,
    pub metadata: serde_json::Value,
    pub ts: i64,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candidate(kind={}, symbol={}, direction={}, score={:.1})",
            self.kind, self.symbol, self.direction, self.raw_score
        )
    }
}

// ============================================================================
// TradingSignal
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TradingSignal {
    pub id: Uuid,
    pub symbol: String,
    pub kind: SignalKind,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64, // 0-100, clamped after all adjustments
    pub tier: Tier,
    pub priority: Priority,
    pub context: Option<ContextAssessment>,
    pub sources: Vec<Producer>,
    pub metadata: serde_json::Value,
    pub ts: i64,
}

impl TradingSignal {
    /// Dedup fingerprint: same symbol, kind and direction within a 5%
    /// confidence band collapse to one signal inside the dedup window.
    pub fn fingerprint(&self) -> String {
        let band = (self.confidence / 5.0).round() as i64;
        format!("{}|{}|{}|{}", self.symbol, self.kind, self.direction, band)
    }
}

impl fmt::Display for TradingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TradingSignal({} {} {} conf={:.0}% {})",
            self.symbol, self.kind, self.direction, self.confidence, self.priority
        )
    }
}

// ============================================================================
// SignalOutcome
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub signal_id: Uuid,
    pub ts: i64,
    pub entry_price: Decimal,
    pub price_at_check: Option<Decimal>,
    pub pct_to_target: f64,
    pub label: OutcomeLabel,
}

impl fmt::Display for SignalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalOutcome({} {} pct_to_target={:.2})",
            self.signal_id, self.label, self.pct_to_target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_signal(confidence: f64) -> TradingSignal {
        TradingSignal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence,
            tier: Tier::T1,
            priority: Priority::from_confidence(confidence),
            context: None,
            sources: vec![Producer::StopHunt],
            metadata: serde_json::Value::Null,
            ts: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_priority_thresholds() {
        assert_eq!(Priority::from_confidence(85.0), Priority::Urgent);
        assert_eq!(Priority::from_confidence(84.9), Priority::Watch);
        assert_eq!(Priority::from_confidence(70.0), Priority::Watch);
        assert_eq!(Priority::from_confidence(69.9), Priority::Info);
    }

    #[test]
    fn test_kind_rank_ordering() {
        assert!(SignalKind::StopHunt.rank() < SignalKind::WhaleAccumulation.rank());
        assert!(SignalKind::WhaleDistribution.rank() < SignalKind::Accumulation.rank());
        assert!(SignalKind::Distribution.rank() < SignalKind::VolumeSpike.rank());
    }

    #[test]
    fn test_fingerprint_confidence_banding() {
        // 73.2 and 76.8 both round to band 15 and share a fingerprint
        let a = make_signal(73.2);
        let b = make_signal(76.8);
        assert_eq!(a.fingerprint(), b.fingerprint());

        // 78 rounds to band 16
        let c = make_signal(78.0);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_display_traits() {
        assert_eq!(format!("{}", OrderSide::Buy), "BUY");
        assert_eq!(format!("{}", Direction::Long), "LONG");
        assert_eq!(format!("{}", SignalKind::StopHunt), "STOP_HUNT");
        assert_eq!(format!("{}", Priority::Urgent), "URGENT");
        assert_eq!(format!("{}", Tier::T3), "T3");
    }

    #[test]
    fn test_order_side_from_str() {
        use std::str::FromStr;

        assert_eq!(OrderSide::from_str("buy").unwrap(), OrderSide::Buy);
        assert_eq!(OrderSide::from_str("SELL").unwrap(), OrderSide::Sell);
        assert!(OrderSide::from_str("HOLD").is_err());
    }
}
