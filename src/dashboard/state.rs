// Dashboard State - read-only snapshots shared with the HTTP/WS surface

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::core::config::DashboardConfig;
use crate::core::types::TradingSignal;
use crate::layer3::order_flow::OrderFlowSummary;
use crate::storage::Database;

/// Incremental push events for dashboard clients.
#[derive(Debug, Clone)]
pub enum DashboardEvent {
    StatsUpdate(Value),
    OrderFlowUpdate(Value),
    NewSignal(Value),
}

impl DashboardEvent {
    pub fn to_frame(&self) -> String {
        let (kind, data) = match self {
            DashboardEvent::StatsUpdate(data) => ("stats_update", data),
            DashboardEvent::OrderFlowUpdate(data) => ("order_flow_update", data),
            DashboardEvent::NewSignal(data) => ("new_signal", data),
        };
        json!({"type": kind, "data": data}).to_string()
    }
}

/// Symbol mutation requests flowing back from the dashboard to the engine.
#[derive(Debug, Clone)]
pub enum CoinCommand {
    Add(String),
    Remove(String),
    Toggle(String, bool),
}

/// Everything the dashboard surface reads. Writers deep-copy payloads
/// before crossing the task boundary.
pub struct DashboardState {
    pub config: DashboardConfig,
    pub db: Arc<Database>,

    counters: RwLock<Value>,
    order_flow: RwLock<HashMap<String, OrderFlowSummary>>,
    recent_signals: RwLock<VecDeque<Value>>,
    monitored: RwLock<HashSet<String>>,
    disabled: RwLock<HashSet<String>>,

    pub events: broadcast::Sender<DashboardEvent>,
    pub coin_commands: mpsc::UnboundedSender<CoinCommand>,

    rate_limiter: RwLock<HashMap<IpAddr, Vec<i64>>>,
}

impl DashboardState {
    pub fn new(
        config: DashboardConfig,
        db: Arc<Database>,
        monitored: Vec<String>,
        coin_commands: mpsc::UnboundedSender<CoinCommand>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1_024);
        Arc::new(Self {
            config,
            db,
            counters: RwLock::new(json!({})),
            order_flow: RwLock::new(HashMap::new()),
            recent_signals: RwLock::new(VecDeque::new()),
            monitored: RwLock::new(monitored.into_iter().collect()),
            disabled: RwLock::new(HashSet::new()),
            events,
            coin_commands,
            rate_limiter: RwLock::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Engine-side updates
    // ========================================================================

    pub fn update_counters(&self, counters: Value) {
        *self.counters.write() = counters.clone();
        let _ = self.events.send(DashboardEvent::StatsUpdate(counters));
    }

    pub fn update_order_flow(&self, summary: OrderFlowSummary) {
        let payload = serde_json::to_value(&summary).unwrap_or(Value::Null);
        self.order_flow.write().insert(summary.symbol.clone(), summary);
        let _ = self.events.send(DashboardEvent::OrderFlowUpdate(payload));
    }

    /// Every signal reaches the dashboard, including ones the context
    /// filter kept away from the messaging sink.
    pub fn push_signal(&self, signal: &TradingSignal, delivered_to_messaging: bool) {
        let payload = json!({
            "id": signal.id,
            "ts": signal.ts,
            "symbol": signal.symbol,
            "kind": signal.kind.to_string(),
            "direction": signal.direction.to_string(),
            "entry": signal.entry,
            "stop": signal.stop,
            "target": signal.target,
            "confidence": signal.confidence,
            "priority": signal.priority.to_string(),
            "context": signal.context.map(|c| c.to_string()),
            "delivered_to_messaging": delivered_to_messaging,
        });

        {
            let mut recent = self.recent_signals.write();
            recent.push_front(payload.clone());
            while recent.len() > self.config.recent_signals_limit {
                recent.pop_back();
            }
        }
        let _ = self.events.send(DashboardEvent::NewSignal(payload));
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn counters(&self) -> Value {
        self.counters.read().clone()
    }

    pub fn order_flow_for(&self, symbol: &str) -> Option<OrderFlowSummary> {
        self.order_flow.read().get(symbol).cloned()
    }

    pub fn recent_signals(&self, limit: usize) -> Vec<Value> {
        self.recent_signals.read().iter().take(limit).cloned().collect()
    }

    pub fn coins(&self) -> Vec<Value> {
        let disabled = self.disabled.read();
        let monitored = self.monitored.read();
        let mut coins: Vec<&String> = monitored.iter().collect();
        coins.sort();
        coins
            .into_iter()
            .map(|symbol| {
                json!({
                    "symbol": symbol,
                    "active": !disabled.contains(symbol.as_str()),
                })
            })
            .collect()
    }

    // ========================================================================
    // Mutations (token-gated at the HTTP layer)
    // ========================================================================

    pub fn add_coin(&self, symbol: &str) -> bool {
        let inserted = self.monitored.write().insert(symbol.to_string());
        if inserted {
            let _ = self.coin_commands.send(CoinCommand::Add(symbol.to_string()));
        }
        inserted
    }

    pub fn remove_coin(&self, symbol: &str) -> bool {
        let removed = self.monitored.write().remove(symbol);
        if removed {
            self.disabled.write().remove(symbol);
            let _ = self.coin_commands.send(CoinCommand::Remove(symbol.to_string()));
        }
        removed
    }

    pub fn toggle_coin(&self, symbol: &str, active: bool) -> bool {
        if !self.monitored.read().contains(symbol) {
            return false;
        }
        if active {
            self.disabled.write().remove(symbol);
        } else {
            self.disabled.write().insert(symbol.to_string());
        }
        let _ = self
            .coin_commands
            .send(CoinCommand::Toggle(symbol.to_string(), active));
        true
    }

    pub fn monitored_coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self.monitored.read().iter().cloned().collect();
        coins.sort();
        coins
    }

    // ========================================================================
    // Auth & rate limiting
    // ========================================================================

    /// Constant-time token comparison; a missing configured token
    /// disables auth entirely.
    pub fn token_matches(&self, presented: &str) -> bool {
        let expected = self.config.api_token.as_bytes();
        if expected.is_empty() {
            return true;
        }
        let presented = presented.as_bytes();
        let mut diff = (expected.len() ^ presented.len()) as u8;
        for i in 0..expected.len() {
            let p = presented.get(i % presented.len().max(1)).copied().unwrap_or(0);
            diff |= expected[i] ^ p;
        }
        diff == 0
    }

    pub fn auth_required(&self) -> bool {
        !self.config.api_token.is_empty()
    }

    /// Sliding one-minute window per remote address.
    pub fn check_rate_limit(&self, addr: IpAddr, now_ms: i64) -> bool {
        let mut limiter = self.rate_limiter.write();
        let entries = limiter.entry(addr).or_default();
        entries.retain(|ts| now_ms - ts < 60_000);
        if entries.len() >= self.config.rate_limit_per_min {
            return false;
        }
        entries.push(now_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, Priority, Producer, SignalKind, Tier};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn state(token: &str, rate: usize) -> Arc<DashboardState> {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        DashboardState::new(
            DashboardConfig {
                api_token: token.to_string(),
                rate_limit_per_min: rate,
                ..DashboardConfig::default()
            },
            db,
            vec!["BTCUSDT".to_string()],
            tx,
        )
    }

    fn signal() -> TradingSignal {
        TradingSignal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence: 93.0,
            tier: Tier::T1,
            priority: Priority::Urgent,
            context: None,
            sources: vec![Producer::StopHunt],
            metadata: serde_json::Value::Null,
            ts: 0,
        }
    }

    #[tokio::test]
    async fn test_token_constant_time_compare() {
        let s = state("secret-token", 30).await;
        assert!(s.token_matches("secret-token"));
        assert!(!s.token_matches("secret-tokeX"));
        assert!(!s.token_matches(""));
        assert!(!s.token_matches("secret-token-longer"));
    }

    #[tokio::test]
    async fn test_empty_token_disables_auth() {
        let s = state("", 30).await;
        assert!(!s.auth_required());
        assert!(s.token_matches("anything"));
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let s = state("t", 3).await;
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(s.check_rate_limit(addr, 0));
        assert!(s.check_rate_limit(addr, 1_000));
        assert!(s.check_rate_limit(addr, 2_000));
        assert!(!s.check_rate_limit(addr, 3_000));
        // A different address has its own window
        assert!(s.check_rate_limit("10.0.0.2".parse().unwrap(), 3_000));
        // The window slides
        assert!(s.check_rate_limit(addr, 61_000));
    }

    #[tokio::test]
    async fn test_recent_signals_bounded() {
        let s = state("t", 30).await;
        for _ in 0..150 {
            s.push_signal(&signal(), true);
        }
        assert_eq!(s.recent_signals(200).len(), s.config.recent_signals_limit);
    }

    #[tokio::test]
    async fn test_coin_mutations() {
        let s = state("t", 30).await;
        assert!(s.add_coin("ETHUSDT"));
        assert!(!s.add_coin("ETHUSDT"));
        assert!(s.toggle_coin("ETHUSDT", false));
        assert!(!s.toggle_coin("NOPEUSDT", false));

        let coins = s.coins();
        let eth = coins
            .iter()
            .find(|c| c["symbol"] == "ETHUSDT")
            .unwrap();
        assert_eq!(eth["active"], false);

        assert!(s.remove_coin("ETHUSDT"));
        assert!(!s.remove_coin("ETHUSDT"));
    }

    #[tokio::test]
    async fn test_push_event_broadcast() {
        let s = state("t", 30).await;
        let mut rx = s.events.subscribe();
        s.push_signal(&signal(), false);

        match rx.try_recv().unwrap() {
            DashboardEvent::NewSignal(data) => {
                assert_eq!(data["symbol"], "BTCUSDT");
                assert_eq!(data["delivered_to_messaging"], false);
            }
            other => panic!("expected NewSignal, got {:?}", other),
        }
    }
}
