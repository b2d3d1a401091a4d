// Engine - wires the pipeline together and owns the task topology
//
// SignalPipeline is the synchronous hot path (ingest -> analyzers ->
// merger -> validator -> scorer -> filter); every method takes an
// explicit clock so a recorded trace replays deterministically. Engine
// wraps it with the async plumbing: feed, ticker, poller, delivery,
// outcomes, persistence and shutdown.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::alerts::telegram::{DeliveryResult, DeliverySignal, TelegramSink};
use crate::core::config::ConfigManager;
use crate::core::types::{Liquidation, OutcomeLabel, Priority, Trade, TradingSignal};
use crate::dashboard::state::{CoinCommand, DashboardState};
use crate::layer1::feed::{trade_channel, FeedClient, LIQUIDATION_CHANNEL};
use crate::layer1::poller::ContextPoller;
use crate::layer2::baseline::VolumeBaseline;
use crate::layer2::buffers::BufferManager;
use crate::layer2::context::ContextBuffer;
use crate::layer2::normalizer::{NormalizedFrame, Normalizer};
use crate::layer3::events::EventPatternDetector;
use crate::layer3::order_flow::{OrderFlowAnalyzer, OrderFlowSummary};
use crate::layer3::stop_hunt::StopHuntDetector;
use crate::signals::context_filter::{FilterDecision, MarketContextFilter};
use crate::signals::merger::SignalMerger;
use crate::signals::scorer::ConfidenceScorer;
use crate::signals::tracker::{DecidedOutcome, OutcomeTracker};
use crate::signals::validator::SignalValidator;
use crate::storage::Database;

pub const CONFIDENCE_STATE_KEY: &str = "confidence_state";
pub const DASHBOARD_COINS_KEY: &str = "dashboard_coins";

/// A signal that cleared every gate, paired with the context decision
/// that says where it may be delivered.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub signal: TradingSignal,
    pub decision: FilterDecision,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
struct PipelineCounters {
    signals_emitted: u64,
    dropped_low_confidence: u64,
}

// ============================================================================
// Synchronous pipeline core
// ============================================================================

pub struct SignalPipeline {
    pub buffers: Arc<BufferManager>,
    pub baseline: Arc<VolumeBaseline>,
    pub context: Arc<ContextBuffer>,
    pub scorer: Arc<ConfidenceScorer>,

    normalizer: Mutex<Normalizer>,
    stop_hunt: Mutex<StopHuntDetector>,
    order_flow: Mutex<OrderFlowAnalyzer>,
    event_patterns: Mutex<EventPatternDetector>,
    merger: Mutex<SignalMerger>,
    validator: Mutex<SignalValidator>,
    filter: MarketContextFilter,
    tracker: Mutex<OutcomeTracker>,
    counters: Mutex<PipelineCounters>,
}

impl SignalPipeline {
    pub fn new(config: &ConfigManager) -> Self {
        let monitoring = config.monitoring();
        let signals = config.signals();
        let context_cfg = config.market_context();
        let outcome_cfg = config.outcome();

        let buffers = Arc::new(BufferManager::new(
            monitoring.max_liquidations_per_symbol,
            monitoring.max_trades_per_symbol,
            monitoring.buffer_retention_secs as i64 * 1_000,
            monitoring.ordering_grace_ms,
        ));
        let context = Arc::new(ContextBuffer::new(context_cfg.max_snapshots));

        Self {
            buffers,
            baseline: Arc::new(VolumeBaseline::new()),
            scorer: Arc::new(ConfidenceScorer::new(signals.min_confidence)),
            normalizer: Mutex::new(Normalizer::new()),
            stop_hunt: Mutex::new(StopHuntDetector::new(monitoring.clone())),
            order_flow: Mutex::new(OrderFlowAnalyzer::new(monitoring.clone())),
            event_patterns: Mutex::new(EventPatternDetector::new(monitoring.clone())),
            merger: Mutex::new(SignalMerger::new(monitoring, signals.coalesce_window_ms)),
            validator: Mutex::new(SignalValidator::new(&signals)),
            filter: MarketContextFilter::new(context_cfg, context.clone()),
            tracker: Mutex::new(OutcomeTracker::new(&outcome_cfg)),
            context,
            counters: Mutex::new(PipelineCounters::default()),
        }
    }

    /// Ingest one raw feed frame. Parse errors are counted, never fatal.
    pub fn ingest_frame(&self, raw: &str, now_ms: i64) {
        let frame = self.normalizer.lock().parse_frame(raw, now_ms);
        match frame {
            Ok(NormalizedFrame::Liquidations(liquidations)) => {
                for liq in liquidations {
                    self.ingest_liquidation(liq, now_ms);
                }
            }
            Ok(NormalizedFrame::Trades(trades)) => {
                for trade in trades {
                    self.ingest_trade(trade, now_ms);
                }
            }
            Ok(NormalizedFrame::Heartbeat) | Ok(NormalizedFrame::SubscribeAck(_)) => {}
            Err(e) => debug!(error = %e, "Frame rejected"),
        }
    }

    /// Append a liquidation and run the stop-hunt trigger.
    pub fn ingest_liquidation(&self, liq: Liquidation, now_ms: i64) {
        let symbol = liq.symbol.clone();
        if !self.buffers.append_liquidation(liq) {
            return;
        }
        if let Some(candidate) = self.stop_hunt.lock().check(&self.buffers, &symbol, now_ms) {
            self.merger.lock().add(candidate, now_ms);
        }
    }

    /// Append a trade; feeds the baseline, the debounced order-flow
    /// trigger, and any cascade waiting on absorption.
    pub fn ingest_trade(&self, trade: Trade, now_ms: i64) {
        let symbol = trade.symbol.clone();
        self.baseline.observe(&symbol, trade.ts, trade.notional_usd);
        if !self.buffers.append_trade(trade) {
            return;
        }
        if let Some(candidate) = self
            .order_flow
            .lock()
            .analyze_debounced(&self.buffers, &symbol, now_ms)
        {
            self.merger.lock().add(candidate, now_ms);
        }
        if let Some(candidate) = self.stop_hunt.lock().check(&self.buffers, &symbol, now_ms) {
            self.merger.lock().add(candidate, now_ms);
        }
    }

    /// Periodic per-symbol analyzer cadence.
    pub fn tick_symbol(&self, symbol: &str, now_ms: i64) {
        let mut candidates = Vec::new();

        if let Some(c) = self.stop_hunt.lock().check(&self.buffers, symbol, now_ms) {
            candidates.push(c);
        }
        if let Some(c) = self.order_flow.lock().analyze(&self.buffers, symbol, now_ms) {
            candidates.push(c);
        }
        candidates.extend(self.event_patterns.lock().analyze(
            &self.buffers,
            &self.baseline,
            symbol,
            now_ms,
        ));

        if !candidates.is_empty() {
            let mut merger = self.merger.lock();
            for candidate in candidates {
                merger.add(candidate, now_ms);
            }
        }
    }

    /// Flush closed coalescing windows through validation, scoring and
    /// the context filter. Returns signals ready for delivery.
    pub fn drain(&self, now_ms: i64) -> Vec<OutboundSignal> {
        let merged = self.merger.lock().poll_ready(&self.buffers, now_ms);
        let mut outbound = Vec::new();

        for mut signal in merged {
            if let Err(reason) = self.validator.lock().validate(&signal, now_ms) {
                debug!(signal = %signal, reason = %reason, "Signal dropped by validator");
                continue;
            }

            if !self.scorer.score(&mut signal) {
                self.counters.lock().dropped_low_confidence += 1;
                debug!(signal = %signal, "Signal below confidence floor");
                continue;
            }

            let decision = self.filter.evaluate(&signal, now_ms);
            if decision.confidence_adjustment != 0.0 {
                signal.confidence =
                    (signal.confidence + decision.confidence_adjustment).clamp(0.0, 100.0);
                signal.priority = Priority::from_confidence(signal.confidence);
            }
            if signal.context.is_none() {
                signal.context = Some(decision.assessment);
            }

            self.counters.lock().signals_emitted += 1;
            outbound.push(OutboundSignal { signal, decision });
        }

        outbound
    }

    /// Start outcome tracking for a delivered signal.
    pub fn track(&self, signal: &TradingSignal) {
        self.tracker.lock().track(signal);
    }

    /// Settle outcomes whose horizon elapsed and feed the scorer.
    pub fn due_outcomes(&self, now_ms: i64) -> Vec<DecidedOutcome> {
        let decided = self.tracker.lock().due_checks(&self.buffers, now_ms);
        for d in &decided {
            if d.outcome.label != OutcomeLabel::Expired {
                self.scorer
                    .record_outcome(d.producer, d.outcome.label == OutcomeLabel::Win);
            }
        }
        decided
    }

    pub fn sweep(&self, now_ms: i64) {
        self.buffers.sweep(now_ms);
    }

    pub fn order_flow_summary(&self, symbol: &str, now_ms: i64) -> Option<OrderFlowSummary> {
        self.order_flow.lock().summarize(&self.buffers, symbol, now_ms)
    }

    /// Aggregate counters for the dashboard.
    pub fn counters(&self) -> serde_json::Value {
        json!({
            "pipeline": &*self.counters.lock(),
            "normalizer": self.normalizer.lock().stats(),
            "buffers": self.buffers.get_stats(),
            "stop_hunt": self.stop_hunt.lock().get_stats(),
            "order_flow": self.order_flow.lock().get_stats(),
            "event_patterns": self.event_patterns.lock().get_stats(),
            "merger": self.merger.lock().get_stats(),
            "validator": self.validator.lock().get_stats(),
            "context_filter": self.filter.get_stats(),
            "tracker": self.tracker.lock().get_stats(),
            "context_buffer": self.context.get_stats(),
        })
    }
}

// ============================================================================
// Async engine
// ============================================================================

pub struct Engine {
    pipeline: Arc<SignalPipeline>,
    config: Arc<ConfigManager>,
    db: Arc<Database>,
    dashboard: Arc<DashboardState>,
    telegram: Option<TelegramSink>,
    delivery_results: Option<mpsc::UnboundedReceiver<DeliveryResult>>,
    coin_commands: Option<mpsc::UnboundedReceiver<CoinCommand>>,
}

impl Engine {
    pub fn new(
        pipeline: Arc<SignalPipeline>,
        config: Arc<ConfigManager>,
        db: Arc<Database>,
        dashboard: Arc<DashboardState>,
        coin_commands: mpsc::UnboundedReceiver<CoinCommand>,
    ) -> Self {
        let telegram_cfg = config.telegram();
        let (telegram, delivery_results) = if telegram_cfg.enabled {
            let (results_tx, results_rx) = mpsc::unbounded_channel();
            (
                Some(TelegramSink::new(telegram_cfg, results_tx)),
                Some(results_rx),
            )
        } else {
            info!("Telegram sink disabled");
            (None, None)
        };

        Self {
            pipeline,
            config,
            db,
            dashboard,
            telegram,
            delivery_results,
            coin_commands: Some(coin_commands),
        }
    }

    /// Run until shutdown flips. Spawns one task per concern and drives
    /// the delivery path from this task.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let feed_cfg = self.config.feed();
        let monitoring = self.config.monitoring();
        let context_cfg = self.config.market_context();
        let storage_cfg = self.config.storage();

        // Restore scorer state from the last run
        match self.db.load_state_blob(CONFIDENCE_STATE_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str(&blob) {
                Ok(state) => {
                    self.pipeline.scorer.restore(state);
                    info!("Confidence state restored");
                }
                Err(e) => warn!(error = %e, "Confidence state blob unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Confidence state load failed"),
        }

        // Feed connection with initial channels
        let feed = Arc::new(FeedClient::new(&feed_cfg));
        let mut channels = vec![LIQUIDATION_CHANNEL.to_string()];
        for symbol in self.dashboard.monitored_coins() {
            channels.push(trade_channel(&symbol, feed_cfg.min_trade_notional_usd));
        }
        if let Err(e) = feed.connect(&channels).await {
            error!(error = %e, "Feed connection failed at start");
        }

        // Context poller
        if context_cfg.enabled {
            let (persist_tx, mut persist_rx) = mpsc::unbounded_channel();
            let symbols: Vec<String> = self
                .dashboard
                .monitored_coins()
                .iter()
                .map(|s| crate::layer2::context::to_base_symbol(s).to_string())
                .collect();
            match ContextPoller::new(context_cfg, symbols, self.pipeline.context.clone(), Some(persist_tx)) {
                Ok(poller) => {
                    tokio::spawn(Arc::new(poller).run(shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Context poller unavailable"),
            }

            let db = self.db.clone();
            tokio::spawn(async move {
                while let Some(snapshot) = persist_rx.recv().await {
                    if let Err(e) = db.save_context_snapshot(&snapshot).await {
                        warn!(error = %e, "Context snapshot persist failed");
                    }
                }
            });
        }

        // Ingest task
        {
            let pipeline = self.pipeline.clone();
            let feed = feed.clone();
            let mut shutdown_rx = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = feed.recv() => match frame {
                            Some(raw) => {
                                pipeline.ingest_frame(&raw, chrono::Utc::now().timestamp_millis());
                            }
                            None => {
                                warn!("Feed channel closed");
                                break;
                            }
                        },
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Coin commands from the dashboard adjust feed subscriptions
        if let Some(mut commands) = self.coin_commands.take() {
            let feed = feed.clone();
            let min_notional = feed_cfg.min_trade_notional_usd;
            tokio::spawn(async move {
                while let Some(command) = commands.recv().await {
                    match command {
                        CoinCommand::Add(symbol) => {
                            let _ = feed.subscribe(&[trade_channel(&symbol, min_notional)]).await;
                        }
                        CoinCommand::Remove(symbol) => {
                            let _ = feed
                                .unsubscribe(&[trade_channel(&symbol, min_notional)])
                                .await;
                        }
                        CoinCommand::Toggle(_, _) => {}
                    }
                }
            });
        }

        // Delivery status updates
        if let Some(mut results) = self.delivery_results.take() {
            let db = self.db.clone();
            tokio::spawn(async move {
                while let Some(result) = results.recv().await {
                    let status = if result.delivered { "delivered" } else { "delivery-failed" };
                    if let Err(e) = db.update_delivery_status(result.signal_id, status).await {
                        warn!(error = %e, "Delivery status persist failed");
                    }
                }
            });
        }

        // Main cadence loop: analyzer ticks, merger flush, outcomes,
        // sweeping, periodic persistence.
        let mut flush_tick = tokio::time::interval(Duration::from_millis(500));
        let mut analyzer_tick =
            tokio::time::interval(Duration::from_secs(monitoring.analyzer_tick_secs));
        let mut outcome_tick = tokio::time::interval(Duration::from_secs(30));
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(60));
        let mut persist_tick = tokio::time::interval(Duration::from_secs(300));
        let mut shutdown_rx = shutdown.clone();

        loop {
            tokio::select! {
                _ = flush_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    for outbound in self.pipeline.drain(now_ms) {
                        self.handle_outbound(outbound).await;
                    }
                }
                _ = analyzer_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    for symbol in self.dashboard.monitored_coins() {
                        self.pipeline.tick_symbol(&symbol, now_ms);
                        if let Some(summary) = self.pipeline.order_flow_summary(&symbol, now_ms) {
                            self.dashboard.update_order_flow(summary);
                        }
                    }
                    self.dashboard.update_counters(self.pipeline.counters());
                }
                _ = outcome_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    for decided in self.pipeline.due_outcomes(now_ms) {
                        if let Err(e) = self.db.save_outcome(&decided.outcome).await {
                            warn!(error = %e, "Outcome persist failed");
                        }
                    }
                }
                _ = sweep_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    self.pipeline.sweep(now_ms);
                    if let Err(e) = self
                        .db
                        .prune_context(now_ms, storage_cfg.context_retention_days)
                        .await
                    {
                        warn!(error = %e, "Context prune failed");
                    }
                }
                _ = persist_tick.tick() => {
                    self.persist_confidence_state().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown(feed).await;
        Ok(())
    }

    /// Persist, broadcast to the dashboard, deliver to messaging when the
    /// context decision allows, then arm outcome tracking.
    async fn handle_outbound(&self, outbound: OutboundSignal) {
        let OutboundSignal { signal, decision } = outbound;

        if let Err(e) = self.db.save_signal(&signal).await {
            warn!(error = %e, "Signal persist failed");
        }

        self.dashboard.push_signal(&signal, decision.deliver_to_messaging);

        if decision.deliver_to_messaging {
            if let Some(telegram) = &self.telegram {
                telegram.deliver(DeliverySignal {
                    signal_id: signal.id,
                    symbol: signal.symbol.clone(),
                    kind: signal.kind,
                    direction: signal.direction,
                    entry: signal.entry,
                    stop: signal.stop,
                    target: signal.target,
                    confidence: signal.confidence,
                    priority: signal.priority,
                    context: signal.context,
                    context_note: Some(decision.reason.clone()),
                    summary: summarize_signal(&signal),
                    degraded: decision.stale,
                    ts: signal.ts,
                });
            }
        }

        self.pipeline.track(&signal);
    }

    async fn persist_confidence_state(&self) {
        let state = self.pipeline.scorer.snapshot();
        match serde_json::to_string(&state) {
            Ok(blob) => {
                if let Err(e) = self.db.save_state_blob(CONFIDENCE_STATE_KEY, &blob).await {
                    warn!(error = %e, "Confidence state persist failed");
                }
            }
            Err(e) => warn!(error = %e, "Confidence state serialize failed"),
        }

        if let Ok(coins) = serde_json::to_string(&self.dashboard.monitored_coins()) {
            if let Err(e) = self.db.save_state_blob(DASHBOARD_COINS_KEY, &coins).await {
                warn!(error = %e, "Dashboard coin set persist failed");
            }
        }
    }

    /// Graceful shutdown: drain the delivery queue with a bounded
    /// timeout, persist scorer state, close the feed.
    async fn shutdown(mut self, feed: Arc<FeedClient>) {
        info!("Engine shutting down");
        feed.disconnect();

        // Flush any merged-but-undelivered signals first
        let now_ms = chrono::Utc::now().timestamp_millis();
        let last = self
            .pipeline
            .drain(now_ms + self.config.signals().coalesce_window_ms);
        for outbound in last {
            self.handle_outbound(outbound).await;
        }

        if let Some(telegram) = self.telegram.take() {
            if let Some(worker) = telegram.close() {
                let timeout = Duration::from_secs(self.config.telegram().delivery_timeout_secs);
                if tokio::time::timeout(timeout, worker).await.is_err() {
                    warn!("Telegram queue flush timed out");
                }
            }
        }

        self.persist_confidence_state().await;
        info!("Engine stopped");
    }
}

fn summarize_signal(signal: &TradingSignal) -> String {
    use crate::alerts::formatter::format_usd;
    use crate::core::types::SignalKind;

    let kind_name = signal.kind.to_string();
    let details = signal
        .metadata
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|list| {
            list.iter()
                .find(|c| c.get("kind").and_then(|k| k.as_str()) == Some(kind_name.as_str()))
        })
        .and_then(|c| c.get("details"));

    match signal.kind {
        SignalKind::StopHunt => {
            let volume = details
                .and_then(|d| d.get("total_volume"))
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            let count = details
                .and_then(|d| d.get("liquidation_count"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            format!("📊 {} liquidated across {} events", format_usd(volume), count)
        }
        SignalKind::Accumulation | SignalKind::Distribution => {
            let ratio = details
                .and_then(|d| d.get("buy_ratio"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            format!("📈 Buy ratio {:.0}% over 5 minutes", ratio * 100.0)
        }
        SignalKind::WhaleAccumulation | SignalKind::WhaleDistribution => {
            "🐋 Large-order cluster in the last 5 minutes".to_string()
        }
        SignalKind::VolumeSpike => {
            let ratio = details
                .and_then(|d| d.get("spike_ratio"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            format!("📈 Volume {:.1}x the 24h baseline", ratio)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigManager;

    #[test]
    fn test_pipeline_counters_shape() {
        let config = ConfigManager::new(None).unwrap();
        let pipeline = SignalPipeline::new(&config);
        let counters = pipeline.counters();

        assert!(counters.get("buffers").is_some());
        assert!(counters.get("validator").is_some());
        assert!(counters.get("normalizer").is_some());
    }

    #[test]
    fn test_ingest_frame_tolerates_garbage() {
        let config = ConfigManager::new(None).unwrap();
        let pipeline = SignalPipeline::new(&config);

        pipeline.ingest_frame("{broken", 1_000);
        pipeline.ingest_frame(r#"{"event":"unknown"}"#, 1_000);
        pipeline.ingest_frame("ping", 1_000);

        let counters = pipeline.counters();
        assert_eq!(counters["normalizer"]["rejected_json"], 1);
    }
}
