// Context Poller - periodic REST polling for open interest and funding
// Fetches OHLC-shaped series and keeps only the freshest candle closes.

use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::config::MarketContextConfig;
use crate::core::types::ContextSnapshot;
use crate::layer2::context::ContextBuffer;

const OI_ENDPOINT: &str = "/api/futures/open-interest/aggregated-history";
const FUNDING_ENDPOINT: &str = "/api/futures/funding-rate/oi-weight-history";
const FAILURE_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("empty series")]
    EmptySeries,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollerStats {
    pub polls_completed: u64,
    pub snapshots_emitted: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_poll_ts: i64,
}

/// Polls the upstream REST API at a fixed cadence per monitored symbol and
/// feeds the context buffer. Failures back off exponentially and never
/// touch the hot path.
pub struct ContextPoller {
    config: MarketContextConfig,
    client: Client,
    symbols: Vec<String>,
    buffer: Arc<ContextBuffer>,
    persist_tx: Option<mpsc::UnboundedSender<ContextSnapshot>>,
    stats: parking_lot::Mutex<PollerStats>,
}

impl ContextPoller {
    pub fn new(
        config: MarketContextConfig,
        symbols: Vec<String>,
        buffer: Arc<ContextBuffer>,
        persist_tx: Option<mpsc::UnboundedSender<ContextSnapshot>>,
    ) -> Result<Self, PollerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            config,
            client,
            symbols,
            buffer,
            persist_tx,
            stats: parking_lot::Mutex::new(PollerStats::default()),
        })
    }

    /// Main polling loop. Runs until the shutdown flag flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            symbols = self.symbols.len(),
            interval_secs = self.config.poll_interval_secs,
            "Context poller started"
        );

        let mut backoff_secs = 0u64;

        loop {
            let cycle_ok = self.poll_all().await;

            {
                let mut stats = self.stats.lock();
                if cycle_ok {
                    stats.polls_completed += 1;
                    stats.consecutive_failures = 0;
                    backoff_secs = 0;
                } else {
                    stats.errors += 1;
                    stats.consecutive_failures += 1;
                    backoff_secs = std::cmp::min(backoff_secs.max(1) * 2, 300);
                    if stats.consecutive_failures >= FAILURE_WARN_THRESHOLD {
                        warn!(
                            consecutive = stats.consecutive_failures,
                            "Context polling failing repeatedly"
                        );
                    }
                }
                stats.last_poll_ts = chrono::Utc::now().timestamp_millis();
            }

            let wait = Duration::from_secs(self.config.poll_interval_secs + backoff_secs);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Context poller stopped");
    }

    /// One poll cycle over every symbol. True when at least one symbol
    /// produced a snapshot and no request errored.
    async fn poll_all(&self) -> bool {
        let mut any_ok = false;
        let mut any_err = false;

        for symbol in &self.symbols {
            match self.poll_symbol(symbol).await {
                Ok(snapshot) => {
                    any_ok = true;
                    debug!(snapshot = %snapshot, "Context snapshot");
                    self.stats.lock().snapshots_emitted += 1;
                    if let Some(tx) = &self.persist_tx {
                        let _ = tx.send(snapshot.clone());
                    }
                    self.buffer.add_snapshot(snapshot);
                }
                Err(e) => {
                    any_err = true;
                    debug!(symbol = %symbol, error = %e, "Context poll failed");
                }
            }
            // Space out per-symbol requests to respect rate limits
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        any_ok && !any_err
    }

    async fn poll_symbol(&self, symbol: &str) -> Result<ContextSnapshot, PollerError> {
        let oi = self.fetch_series(OI_ENDPOINT, symbol).await?;
        let funding = self.fetch_series(FUNDING_ENDPOINT, symbol).await?;

        let (oi_now, oi_prev) = oi;
        let (funding_now, _) = funding;

        let oi_change_pct = if oi_prev > 0.0 {
            (oi_now - oi_prev) / oi_prev * 100.0
        } else {
            0.0
        };

        Ok(ContextSnapshot {
            symbol: symbol.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            open_interest_usd: oi_now,
            previous_oi_usd: oi_prev,
            oi_change_pct,
            funding_rate: funding_now,
            source_exchange: "aggregated".to_string(),
        })
    }

    /// Fetch the last two 1h candles and return (latest close, previous
    /// close). The API wraps candles as {"code":"0","data":[...]}.
    async fn fetch_series(&self, endpoint: &str, symbol: &str) -> Result<(f64, f64), PollerError> {
        let url = format!("{}{}", self.config.rest_base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .header("CG-API-KEY", &self.config.api_key)
            .query(&[("symbol", symbol), ("interval", "1h"), ("limit", "2")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PollerError::Api(format!("HTTP {}", response.status())));
        }

        let body: Value = response.json().await?;
        parse_candle_closes(&body)
    }

    pub fn get_stats(&self) -> PollerStats {
        self.stats.lock().clone()
    }
}

/// Extract (latest_close, previous_close) from an OHLC payload whose
/// values may be numbers or numeric strings.
pub fn parse_candle_closes(body: &Value) -> Result<(f64, f64), PollerError> {
    let code = body
        .get("code")
        .map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    if code != "0" {
        let msg = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")
            .to_string();
        return Err(PollerError::Api(msg));
    }

    let candles = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or(PollerError::EmptySeries)?;
    if candles.is_empty() {
        return Err(PollerError::EmptySeries);
    }

    let close_of = |candle: &Value| -> Option<f64> {
        match candle.get("close")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };

    let latest = close_of(&candles[candles.len() - 1]).ok_or(PollerError::EmptySeries)?;
    let previous = if candles.len() >= 2 {
        close_of(&candles[candles.len() - 2]).unwrap_or(latest)
    } else {
        latest
    };

    Ok((latest, previous))
}
