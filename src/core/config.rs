// Configuration Management for Signal Hunt
// JSON file + environment overlay, validated at startup

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::Tier;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub api_key: String,
    pub ws_url: String,

    // Connection settings
    pub heartbeat_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub max_consecutive_timeouts: u32,
    pub max_reconnect_attempts: u32,
    pub connection_wait_ms: u64,

    // Trade channel subscription filter
    pub min_trade_notional_usd: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            ws_url: "wss://open-ws.coinglass.com/ws-api".to_string(),
            heartbeat_interval_secs: 20,
            read_timeout_secs: 30,
            max_consecutive_timeouts: 3,
            max_reconnect_attempts: 10,
            connection_wait_ms: 500,
            min_trade_notional_usd: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsConfig {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

impl Default for PairsConfig {
    fn default() -> Self {
        Self {
            primary: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            secondary: vec!["SOLUSDT".to_string(), "XRPUSDT".to_string()],
        }
    }
}

impl PairsConfig {
    pub fn all(&self) -> Vec<String> {
        let mut pairs = self.primary.clone();
        for s in &self.secondary {
            if !pairs.contains(s) {
                pairs.push(s.clone());
            }
        }
        pairs
    }
}

/// Tier assignment and tier-scaled detection thresholds. USD amounts are
/// whole dollars so threshold comparisons stay exact in decimal arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub tier1_symbols: Vec<String>,
    pub tier2_symbols: Vec<String>,

    // Cascade volume thresholds (30s window), strict greater-than
    pub tier1_cascade_usd: u64,
    pub tier2_cascade_usd: u64,
    pub tier3_cascade_usd: u64,

    // Large-order (whale) thresholds
    pub tier1_large_order_usd: u64,
    pub tier2_large_order_usd: u64,
    pub tier3_large_order_usd: u64,

    // Absorption detection
    pub absorption_min_usd: u64,
    pub tier1_absorption_usd: u64,
    pub tier2_absorption_usd: u64,
    pub tier3_absorption_usd: u64,

    // Whale activity minima
    pub flow_min_large_orders: u32,
    pub whale_min_orders: u32,

    // Buffer sizing
    pub max_liquidations_per_symbol: usize,
    pub max_trades_per_symbol: usize,
    pub buffer_retention_secs: u64,
    pub ordering_grace_ms: i64,

    // Analyzer cadence
    pub analyzer_tick_secs: u64,
    pub trade_debounce_ms: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            tier1_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tier2_symbols: vec![
                "SOLUSDT".to_string(),
                "XRPUSDT".to_string(),
                "BNBUSDT".to_string(),
            ],
            tier1_cascade_usd: 2_000_000,
            tier2_cascade_usd: 200_000,
            tier3_cascade_usd: 50_000,
            tier1_large_order_usd: 10_000,
            tier2_large_order_usd: 5_000,
            tier3_large_order_usd: 2_000,
            absorption_min_usd: 5_000,
            tier1_absorption_usd: 100_000,
            tier2_absorption_usd: 20_000,
            tier3_absorption_usd: 5_000,
            flow_min_large_orders: 3,
            whale_min_orders: 5,
            max_liquidations_per_symbol: 1_000,
            max_trades_per_symbol: 500,
            buffer_retention_secs: 3_600,
            ordering_grace_ms: 2_000,
            analyzer_tick_secs: 15,
            trade_debounce_ms: 2_000,
        }
    }
}

impl MonitoringConfig {
    /// Unknown symbols default to tier 3.
    pub fn tier_of(&self, symbol: &str) -> Tier {
        if self.tier1_symbols.iter().any(|s| s == symbol) {
            Tier::T1
        } else if self.tier2_symbols.iter().any(|s| s == symbol) {
            Tier::T2
        } else {
            Tier::T3
        }
    }

    pub fn cascade_threshold(&self, tier: Tier) -> Decimal {
        match tier {
            Tier::T1 => Decimal::from(self.tier1_cascade_usd),
            Tier::T2 => Decimal::from(self.tier2_cascade_usd),
            Tier::T3 => Decimal::from(self.tier3_cascade_usd),
        }
    }

    pub fn large_order_threshold(&self, tier: Tier) -> Decimal {
        match tier {
            Tier::T1 => Decimal::from(self.tier1_large_order_usd),
            Tier::T2 => Decimal::from(self.tier2_large_order_usd),
            Tier::T3 => Decimal::from(self.tier3_large_order_usd),
        }
    }

    pub fn absorption_threshold(&self, tier: Tier) -> Decimal {
        match tier {
            Tier::T1 => Decimal::from(self.tier1_absorption_usd),
            Tier::T2 => Decimal::from(self.tier2_absorption_usd),
            Tier::T3 => Decimal::from(self.tier3_absorption_usd),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    pub min_confidence: f64,
    pub max_signals_per_hour: usize,
    pub cooldown_minutes: u64,
    pub dedup_window_seconds: u64,
    pub coalesce_window_ms: i64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            min_confidence: 70.0,
            max_signals_per_hour: 50,
            cooldown_minutes: 5,
            dedup_window_seconds: 300,
            coalesce_window_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContextConfig {
    pub enabled: bool,
    pub api_key: String,
    pub rest_base_url: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_snapshots: usize,

    // Filtering
    pub filter_mode: String, // "strict" | "normal" | "permissive"
    pub confidence_adjust: bool,
    pub funding_hi: f64, // crowded threshold as signed fraction per 8h
    pub funding_lo: f64,
    pub oi_change_threshold_pct: f64,
    pub max_age_secs: u64,
}

impl Default for MarketContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            rest_base_url: "https://open-api-v4.coinglass.com".to_string(),
            poll_interval_secs: 300,
            request_timeout_secs: 10,
            max_snapshots: 72,
            filter_mode: "normal".to_string(),
            confidence_adjust: true,
            funding_hi: 0.0001,
            funding_lo: 0.0001,
            oi_change_threshold_pct: 2.0,
            max_age_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub bind_addr: String,
    pub api_token: String,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_min: usize,
    pub recent_signals_limit: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            api_token: String::new(),
            cors_origins: vec!["*".to_string()],
            rate_limit_per_min: 30,
            recent_signals_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    pub horizon_minutes: u64,
    pub win_fraction: f64,
    pub price_staleness_secs: u64,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: 15,
            win_fraction: 0.5,
            price_staleness_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: i64,
    pub delivery_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: 0,
            delivery_timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    pub context_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/signal_hunt.db".to_string(),
            context_retention_days: 7,
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub pairs: Vec<String>,
    pub min_confidence: f64,
    pub max_signals_per_hour: usize,
    pub filter_mode: String,
    pub context_enabled: bool,
    pub telegram_enabled: bool,
    pub dashboard_addr: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    feed: Arc<RwLock<FeedConfig>>,
    pairs: Arc<RwLock<PairsConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
    signals: Arc<RwLock<SignalsConfig>>,
    market_context: Arc<RwLock<MarketContextConfig>>,
    dashboard: Arc<RwLock<DashboardConfig>>,
    outcome: Arc<RwLock<OutcomeConfig>>,
    telegram: Arc<RwLock<TelegramConfig>>,
    storage: Arc<RwLock<StorageConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            feed: Arc::new(RwLock::new(FeedConfig::default())),
            pairs: Arc::new(RwLock::new(PairsConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
            signals: Arc::new(RwLock::new(SignalsConfig::default())),
            market_context: Arc::new(RwLock::new(MarketContextConfig::default())),
            dashboard: Arc::new(RwLock::new(DashboardConfig::default())),
            outcome: Arc::new(RwLock::new(OutcomeConfig::default())),
            telegram: Arc::new(RwLock::new(TelegramConfig::default())),
            storage: Arc::new(RwLock::new(StorageConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file. Missing file is not an error;
    /// unknown sections are ignored, malformed sections keep defaults.
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        macro_rules! load_section {
            ($key:expr, $ty:ty, $slot:expr) => {
                if let Some(data) = config_data.get($key) {
                    match serde_json::from_value::<$ty>(data.clone()) {
                        Ok(section) => *$slot.write() = section,
                        Err(e) => warn!(section = $key, error = %e, "Config section malformed, keeping defaults"),
                    }
                }
            };
        }

        load_section!("feed", FeedConfig, self.feed);
        load_section!("pairs", PairsConfig, self.pairs);
        load_section!("monitoring", MonitoringConfig, self.monitoring);
        load_section!("signals", SignalsConfig, self.signals);
        load_section!("market_context", MarketContextConfig, self.market_context);
        load_section!("dashboard", DashboardConfig, self.dashboard);
        load_section!("outcome", OutcomeConfig, self.outcome);
        load_section!("telegram", TelegramConfig, self.telegram);
        load_section!("storage", StorageConfig, self.storage);

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Load sensitive data from environment variables.
    pub fn load_from_env(&mut self) {
        if let Ok(api_key) = std::env::var("FEED_API_KEY") {
            self.feed.write().api_key = api_key.clone();
            self.market_context.write().api_key = api_key;
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.write().bot_token = token;
        }
        if let Ok(chat_id) = std::env::var("TELEGRAM_CHAT_ID") {
            if let Ok(id) = chat_id.parse() {
                let mut tg = self.telegram.write();
                tg.chat_id = id;
                tg.enabled = !tg.bot_token.is_empty();
            }
        }
        if let Ok(token) = std::env::var("DASHBOARD_API_TOKEN") {
            self.dashboard.write().api_token = token;
        }
    }

    /// Validate configuration. Returns Ok(false) with warnings when the
    /// config is usable but incomplete (e.g. missing API keys).
    pub fn validate(&self) -> Result<bool, ConfigError> {
        let mut errors = Vec::new();
        let feed = self.feed.read();
        let signals = self.signals.read();
        let context = self.market_context.read();
        let outcome = self.outcome.read();

        if feed.api_key.is_empty() {
            errors.push("feed API key is required".to_string());
        }
        if !(0.0..=100.0).contains(&signals.min_confidence) {
            errors.push("signals.min_confidence must be within 0..100".to_string());
        }
        if signals.max_signals_per_hour == 0 {
            errors.push("signals.max_signals_per_hour must be positive".to_string());
        }
        if !matches!(context.filter_mode.as_str(), "strict" | "normal" | "permissive") {
            errors.push(format!(
                "market_context.filter_mode '{}' is not one of strict/normal/permissive",
                context.filter_mode
            ));
        }
        if !(0.0..=1.0).contains(&outcome.win_fraction) {
            errors.push("outcome.win_fraction must be within 0..1".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Ok(false);
        }

        info!("Configuration validated successfully");
        Ok(true)
    }

    pub fn get_summary(&self) -> ConfigSummary {
        ConfigSummary {
            pairs: self.pairs.read().all(),
            min_confidence: self.signals.read().min_confidence,
            max_signals_per_hour: self.signals.read().max_signals_per_hour,
            filter_mode: self.market_context.read().filter_mode.clone(),
            context_enabled: self.market_context.read().enabled,
            telegram_enabled: self.telegram.read().enabled,
            dashboard_addr: self.dashboard.read().bind_addr.clone(),
        }
    }

    // Getters for each config section

    pub fn feed(&self) -> FeedConfig {
        self.feed.read().clone()
    }

    pub fn pairs(&self) -> PairsConfig {
        self.pairs.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }

    pub fn signals(&self) -> SignalsConfig {
        self.signals.read().clone()
    }

    pub fn market_context(&self) -> MarketContextConfig {
        self.market_context.read().clone()
    }

    pub fn dashboard(&self) -> DashboardConfig {
        self.dashboard.read().clone()
    }

    pub fn outcome(&self) -> OutcomeConfig {
        self.outcome.read().clone()
    }

    pub fn telegram(&self) -> TelegramConfig {
        self.telegram.read().clone()
    }

    pub fn storage(&self) -> StorageConfig {
        self.storage.read().clone()
    }
}

// Global config instance (thread-safe singleton)
static GLOBAL_CONFIG: OnceLock<Arc<RwLock<ConfigManager>>> = OnceLock::new();

/// Get global configuration instance (singleton)
pub fn get_config() -> Arc<RwLock<ConfigManager>> {
    Arc::clone(GLOBAL_CONFIG.get_or_init(|| {
        Arc::new(RwLock::new(
            ConfigManager::new(None).expect("Failed to create default config"),
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let feed = FeedConfig::default();
        assert_eq!(feed.ws_url, "wss://open-ws.coinglass.com/ws-api");
        assert_eq!(feed.max_consecutive_timeouts, 3);

        let monitoring = MonitoringConfig::default();
        assert_eq!(monitoring.tier1_cascade_usd, 2_000_000);
        assert_eq!(monitoring.max_liquidations_per_symbol, 1_000);
        assert_eq!(monitoring.max_trades_per_symbol, 500);

        let signals = SignalsConfig::default();
        assert_eq!(signals.max_signals_per_hour, 50);
        assert_eq!(signals.min_confidence, 70.0);
    }

    #[test]
    fn test_tier_assignment() {
        let monitoring = MonitoringConfig::default();
        assert_eq!(monitoring.tier_of("BTCUSDT"), Tier::T1);
        assert_eq!(monitoring.tier_of("SOLUSDT"), Tier::T2);
        // Never-seen symbol defaults to tier 3
        assert_eq!(monitoring.tier_of("PEPEUSDT"), Tier::T3);
    }

    #[test]
    fn test_tier_thresholds() {
        let monitoring = MonitoringConfig::default();
        assert_eq!(monitoring.cascade_threshold(Tier::T1), Decimal::from(2_000_000u64));
        assert_eq!(monitoring.cascade_threshold(Tier::T3), Decimal::from(50_000u64));
        assert_eq!(monitoring.large_order_threshold(Tier::T3), Decimal::from(2_000u64));
        assert_eq!(monitoring.absorption_threshold(Tier::T2), Decimal::from(20_000u64));
    }

    #[test]
    fn test_pairs_all_dedup() {
        let pairs = PairsConfig {
            primary: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            secondary: vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()],
        };
        let all = pairs.all();
        assert_eq!(all, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }

    #[test]
    fn test_config_manager_validation() {
        let manager = ConfigManager::new(None).unwrap();
        // Default config has no API key, so validation flags it
        let ok = manager.validate().unwrap();
        if std::env::var("FEED_API_KEY").is_err() {
            assert!(!ok);
        }
    }

    #[test]
    fn test_config_summary() {
        let manager = ConfigManager::new(None).unwrap();
        let summary = manager.get_summary();
        assert!(summary.pairs.contains(&"BTCUSDT".to_string()));
        assert_eq!(summary.max_signals_per_hour, 50);
        assert_eq!(summary.filter_mode, "normal");
    }
}
