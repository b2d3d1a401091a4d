// Ingestion Normaliser - single seam for vendor field names and
// stringly-typed numerics. Everything below this layer sees decimal
// numerics and canonical names.

use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{Liquidation, LiquidationSide, OrderSide, Trade};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid numeric in field '{field}': {value}")]
    InvalidNumeric { field: &'static str, value: String },
    #[error("record rejected: {0}")]
    Rejected(&'static str),
}

// ============================================================================
// Normalised Frames
// ============================================================================

/// All frame shapes the feed can deliver. Heartbeats and subscription acks
/// are surfaced so the connection layer can track liveness; data frames
/// carry canonical records.
#[derive(Debug, Clone)]
pub enum NormalizedFrame {
    Heartbeat,
    SubscribeAck(String),
    Liquidations(Vec<Liquidation>),
    Trades(Vec<Trade>),
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NormalizerStats {
    pub frames_parsed: u64,
    pub liquidations_emitted: u64,
    pub trades_emitted: u64,
    pub rejected_json: u64,
    pub rejected_missing_symbol: u64,
    pub rejected_bad_price: u64,
    pub rejected_bad_notional: u64,
    pub rejected_bad_numeric: u64,
    pub rejected_unknown_side: u64,
}

impl NormalizerStats {
    pub fn total_rejected(&self) -> u64 {
        self.rejected_json
            + self.rejected_missing_symbol
            + self.rejected_bad_price
            + self.rejected_bad_notional
            + self.rejected_bad_numeric
            + self.rejected_unknown_side
    }
}

impl fmt::Display for NormalizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Normalizer(frames={}, liqs={}, trades={}, rejected={})",
            self.frames_parsed,
            self.liquidations_emitted,
            self.trades_emitted,
            self.total_rejected()
        )
    }
}

// ============================================================================
// Numeric Helpers
// ============================================================================

/// Parse a Decimal from either a JSON number or a numeric string.
/// Numbers go through their literal text representation so no binary
/// float round-trip is introduced.
fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Fetch the first present field among vendor aliases.
fn field<'a>(data: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|name| data.get(*name))
}

// ============================================================================
// Normalizer
// ============================================================================

/// Rewrites raw feed frames into canonical records. One instance per
/// connection; counts every rejection without ever failing the stream.
pub struct Normalizer {
    stats: NormalizerStats,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            stats: NormalizerStats::default(),
        }
    }

    /// Parse one raw frame. `now_ms` backfills a missing event timestamp.
    pub fn parse_frame(&mut self, raw: &str, now_ms: i64) -> Result<NormalizedFrame, ParseError> {
        self.stats.frames_parsed += 1;

        // Heartbeats come as bare strings or {"event":"pong"}
        if raw.trim() == "ping" || raw.trim() == "pong" {
            return Ok(NormalizedFrame::Heartbeat);
        }

        let value: Value = serde_json::from_str(raw).map_err(|e| {
            self.stats.rejected_json += 1;
            ParseError::InvalidJson(e.to_string())
        })?;

        let event = value
            .get("event")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown");

        match event {
            "ping" | "pong" => Ok(NormalizedFrame::Heartbeat),
            "subscribe" => {
                let channel = value
                    .get("channel")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(NormalizedFrame::SubscribeAck(channel))
            }
            "liquidation" => {
                let records = self.collect_records(&value);
                let mut liquidations = Vec::with_capacity(records.len());
                for record in records {
                    match self.parse_liquidation(record, now_ms) {
                        Ok(liq) => {
                            self.stats.liquidations_emitted += 1;
                            liquidations.push(liq);
                        }
                        Err(e) => debug!(error = %e, "Liquidation record rejected"),
                    }
                }
                Ok(NormalizedFrame::Liquidations(liquidations))
            }
            "trade" => {
                let records = self.collect_records(&value);
                let mut trades = Vec::with_capacity(records.len());
                for record in records {
                    match self.parse_trade(record, now_ms) {
                        Ok(trade) => {
                            self.stats.trades_emitted += 1;
                            trades.push(trade);
                        }
                        Err(e) => debug!(error = %e, "Trade record rejected"),
                    }
                }
                Ok(NormalizedFrame::Trades(trades))
            }
            other => Err(ParseError::InvalidJson(format!("unknown event '{}'", other))),
        }
    }

    /// The data payload is a single object or an array of objects.
    fn collect_records<'a>(&self, value: &'a Value) -> Vec<&'a Value> {
        match value.get("data") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => Vec::new(),
        }
    }

    fn parse_liquidation(&mut self, data: &Value, now_ms: i64) -> Result<Liquidation, ParseError> {
        let symbol = self.require_symbol(data)?;
        let price = self.require_price(data)?;
        let notional = self.require_notional(data)?;

        let side = match field(data, &["side"]).and_then(parse_i64) {
            Some(1) => LiquidationSide::LongLiquidated,
            Some(2) => LiquidationSide::ShortLiquidated,
            _ => {
                self.stats.rejected_unknown_side += 1;
                return Err(ParseError::Rejected("unknown liquidation side"));
            }
        };

        Ok(Liquidation {
            symbol,
            exchange: self.exchange(data),
            price,
            side,
            notional_usd: notional,
            ts: self.timestamp(data, now_ms),
        })
    }

    fn parse_trade(&mut self, data: &Value, now_ms: i64) -> Result<Trade, ParseError> {
        let symbol = self.require_symbol(data)?;
        let price = self.require_price(data)?;
        let notional = self.require_notional(data)?;

        let side = match field(data, &["side"]).and_then(parse_i64) {
            Some(1) => OrderSide::Sell,
            Some(2) => OrderSide::Buy,
            _ => {
                self.stats.rejected_unknown_side += 1;
                return Err(ParseError::Rejected("unknown trade side"));
            }
        };

        Ok(Trade {
            symbol,
            exchange: self.exchange(data),
            price,
            side,
            notional_usd: notional,
            ts: self.timestamp(data, now_ms),
        })
    }

    fn require_symbol(&mut self, data: &Value) -> Result<String, ParseError> {
        let symbol = field(data, &["symbol", "pair"])
            .and_then(|s| s.as_str())
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_default();

        if symbol.is_empty() {
            self.stats.rejected_missing_symbol += 1;
            return Err(ParseError::MissingField("symbol"));
        }
        Ok(symbol)
    }

    fn require_price(&mut self, data: &Value) -> Result<Decimal, ParseError> {
        let raw = field(data, &["price", "p"]).ok_or_else(|| {
            self.stats.rejected_bad_price += 1;
            ParseError::MissingField("price")
        })?;
        let price = parse_decimal(raw).ok_or_else(|| {
            self.stats.rejected_bad_numeric += 1;
            ParseError::InvalidNumeric {
                field: "price",
                value: raw.to_string(),
            }
        })?;
        if price <= Decimal::ZERO {
            self.stats.rejected_bad_price += 1;
            return Err(ParseError::Rejected("price <= 0"));
        }
        Ok(price)
    }

    fn require_notional(&mut self, data: &Value) -> Result<Decimal, ParseError> {
        let raw = field(data, &["volUsd", "vol", "volume_usd"]).ok_or_else(|| {
            self.stats.rejected_bad_notional += 1;
            ParseError::MissingField("volUsd")
        })?;
        let notional = parse_decimal(raw).ok_or_else(|| {
            self.stats.rejected_bad_numeric += 1;
            ParseError::InvalidNumeric {
                field: "volUsd",
                value: raw.to_string(),
            }
        })?;
        if notional <= Decimal::ZERO {
            self.stats.rejected_bad_notional += 1;
            return Err(ParseError::Rejected("notional <= 0"));
        }
        Ok(notional)
    }

    fn exchange(&self, data: &Value) -> String {
        field(data, &["exName", "exchange"])
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string()
    }

    fn timestamp(&self, data: &Value, now_ms: i64) -> i64 {
        field(data, &["time", "ts"])
            .and_then(parse_i64)
            .filter(|ts| *ts > 0)
            .unwrap_or(now_ms)
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats.clone()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}
