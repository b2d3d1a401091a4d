// Core layer: shared types, configuration, logging

pub mod config;
pub mod logger;
pub mod types;

pub use config::{
    ConfigError, ConfigManager, DashboardConfig, FeedConfig, MarketContextConfig,
    MonitoringConfig, OutcomeConfig, PairsConfig, SignalsConfig, StorageConfig,
    TelegramConfig, get_config,
};
pub use types::{
    Candidate, ConnectionStatus, ContextAssessment, ContextSnapshot, Direction,
    Liquidation, LiquidationSide, OrderSide, OutcomeLabel, PriceZone, Priority,
    Producer, SignalKind, SignalOutcome, Tier, Trade, TradeLevels, TradingSignal,
};
