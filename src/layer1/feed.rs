// Feed Client - upstream market-data stream over WebSocket
// Auth is an API key in the connection URL; the feed takes no login frame.

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::core::config::FeedConfig;
use crate::core::types::ConnectionStatus;

/// The global liquidation channel carries every symbol.
pub const LIQUIDATION_CHANNEL: &str = "liquidationOrders";

/// Per-symbol aggregated-trades channel with a minimum-notional filter.
pub fn trade_channel(symbol: &str, min_notional_usd: u64) -> String {
    format!("aggTrade@{}@{}", symbol.to_uppercase(), min_notional_usd)
}

/// Commands sent to the WebSocket event loop
#[derive(Debug)]
enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FeedStats {
    pub state: ConnectionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub reconnects: u64,
    pub idle_restarts: u64,
    pub active_subscriptions: usize,
}

impl fmt::Display for FeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FeedStats(state={:?}, messages={}, errors={}, reconnects={}, subs={})",
            self.state, self.message_count, self.error_count, self.reconnects,
            self.active_subscriptions
        )
    }
}

/// WebSocket client for the upstream feed with reconnect, heartbeat reads
/// and dynamic subscription management. Subscriptions survive reconnects.
pub struct FeedClient {
    url: String,
    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<RwLock<u64>>,
    error_count: Arc<RwLock<u64>>,
    reconnects: Arc<RwLock<u64>>,
    idle_restarts: Arc<RwLock<u64>>,

    message_rx: Arc<AsyncRwLock<Option<mpsc::UnboundedReceiver<String>>>>,
    cmd_tx: Arc<AsyncRwLock<Option<mpsc::UnboundedSender<FeedCommand>>>>,

    active_subscriptions: Arc<RwLock<HashSet<String>>>,
    next_request_id: Arc<AtomicU32>,

    read_timeout_secs: u64,
    max_consecutive_timeouts: u32,
    max_reconnect_attempts: u32,
    connection_wait_ms: u64,
}

impl FeedClient {
    pub fn new(config: &FeedConfig) -> Self {
        // API key travels as a query parameter at connection establishment
        let url = format!("{}?apiKey={}", config.ws_url, config.api_key);

        Self {
            url,
            state: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            message_count: Arc::new(RwLock::new(0)),
            error_count: Arc::new(RwLock::new(0)),
            reconnects: Arc::new(RwLock::new(0)),
            idle_restarts: Arc::new(RwLock::new(0)),
            message_rx: Arc::new(AsyncRwLock::new(None)),
            cmd_tx: Arc::new(AsyncRwLock::new(None)),
            active_subscriptions: Arc::new(RwLock::new(HashSet::new())),
            next_request_id: Arc::new(AtomicU32::new(1)),
            read_timeout_secs: config.read_timeout_secs,
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            max_reconnect_attempts: config.max_reconnect_attempts,
            connection_wait_ms: config.connection_wait_ms,
        }
    }

    /// Connect and keep a background task running the stream. Initial
    /// channels are registered before the first connect so the session
    /// subscribes as soon as the socket opens.
    pub async fn connect(&self, channels: &[String]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut subs = self.active_subscriptions.write();
            for channel in channels {
                subs.insert(channel.clone());
            }
        }

        info!(channels = channels.len(), "Connecting to feed");
        *self.state.write() = ConnectionStatus::Connecting;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel::<String>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<FeedCommand>();

        *self.message_rx.write().await = Some(msg_rx);
        *self.cmd_tx.write().await = Some(cmd_tx);

        let url = self.url.clone();
        let state = self.state.clone();
        let message_count = self.message_count.clone();
        let error_count = self.error_count.clone();
        let reconnects = self.reconnects.clone();
        let idle_restarts = self.idle_restarts.clone();
        let active_subs = self.active_subscriptions.clone();
        let next_id = self.next_request_id.clone();
        let read_timeout = self.read_timeout_secs;
        let max_timeouts = self.max_consecutive_timeouts;
        let max_reconnects = self.max_reconnect_attempts;

        tokio::spawn(async move {
            if let Err(e) = run_feed(
                url,
                state.clone(),
                message_count,
                error_count,
                reconnects,
                idle_restarts,
                msg_tx,
                cmd_rx,
                active_subs,
                next_id,
                read_timeout,
                max_timeouts,
                max_reconnects,
            )
            .await
            {
                error!(error = %e, "Feed fatal error");
                *state.write() = ConnectionStatus::Failed;
            }
        });

        tokio::time::sleep(Duration::from_millis(self.connection_wait_ms)).await;
        Ok(())
    }

    /// Subscribe to additional channels while connected.
    pub async fn subscribe(&self, channels: &[String]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut subs = self.active_subscriptions.write();
            for channel in channels {
                subs.insert(channel.clone());
            }
        }
        let tx_lock = self.cmd_tx.read().await;
        match tx_lock.as_ref() {
            Some(tx) => {
                tx.send(FeedCommand::Subscribe(channels.to_vec()))?;
                Ok(())
            }
            None => Err("Feed not connected".into()),
        }
    }

    pub async fn unsubscribe(&self, channels: &[String]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut subs = self.active_subscriptions.write();
            for channel in channels {
                subs.remove(channel);
            }
        }
        let tx_lock = self.cmd_tx.read().await;
        match tx_lock.as_ref() {
            Some(tx) => {
                tx.send(FeedCommand::Unsubscribe(channels.to_vec()))?;
                Ok(())
            }
            None => Err("Feed not connected".into()),
        }
    }

    /// Receive next raw frame.
    pub async fn recv(&self) -> Option<String> {
        let mut rx_lock = self.message_rx.write().await;
        match rx_lock.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn disconnect(&self) {
        info!("Disconnecting feed");
        *self.state.write() = ConnectionStatus::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionStatus::Connected
    }

    pub fn get_stats(&self) -> FeedStats {
        FeedStats {
            state: *self.state.read(),
            message_count: *self.message_count.read(),
            error_count: *self.error_count.read(),
            reconnects: *self.reconnects.read(),
            idle_restarts: *self.idle_restarts.read(),
            active_subscriptions: self.active_subscriptions.read().len(),
        }
    }
}

/// Main feed loop with automatic reconnection and exponential backoff.
#[allow(clippy::too_many_arguments)]
async fn run_feed(
    url: String,
    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<RwLock<u64>>,
    error_count: Arc<RwLock<u64>>,
    reconnects: Arc<RwLock<u64>>,
    idle_restarts: Arc<RwLock<u64>>,
    message_tx: mpsc::UnboundedSender<String>,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    active_subscriptions: Arc<RwLock<HashSet<String>>>,
    next_request_id: Arc<AtomicU32>,
    read_timeout_secs: u64,
    max_consecutive_timeouts: u32,
    max_reconnect_attempts: u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut reconnect_attempt = 0u32;

    loop {
        let current_subs: Vec<String> = active_subscriptions.read().iter().cloned().collect();

        let session = run_session(
            &url,
            &current_subs,
            state.clone(),
            message_count.clone(),
            error_count.clone(),
            idle_restarts.clone(),
            &message_tx,
            &mut cmd_rx,
            next_request_id.clone(),
            read_timeout_secs,
            max_consecutive_timeouts,
        )
        .await;

        match session {
            Ok(SessionEnd::Shutdown) => {
                info!("Feed session ended by disconnect");
                return Ok(());
            }
            Ok(SessionEnd::Restart) => {
                reconnect_attempt = 0; // Clean restart after idle detection
            }
            Err(e) => {
                error!(error = %e, "Feed session error");
                *error_count.write() += 1;
                *state.write() = ConnectionStatus::Failed;
            }
        }

        if reconnect_attempt >= max_reconnect_attempts {
            error!(max_attempts = max_reconnect_attempts, "Max feed reconnection attempts reached");
            *state.write() = ConnectionStatus::Failed;
            return Err("max reconnection attempts reached".into());
        }

        let delay_secs = std::cmp::min(2_u64.pow(reconnect_attempt), 60);
        reconnect_attempt += 1;
        *reconnects.write() += 1;

        warn!(delay_secs = delay_secs, attempt = reconnect_attempt, "Feed reconnecting");
        *state.write() = ConnectionStatus::Reconnecting;
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }
}

enum SessionEnd {
    Shutdown,
    Restart,
}

/// One connection attempt: subscribe to all active channels, then pump
/// frames until the server closes, an error occurs, or the heartbeat
/// goes quiet for three consecutive read windows.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    url: &str,
    initial_subscriptions: &[String],
    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<RwLock<u64>>,
    error_count: Arc<RwLock<u64>>,
    idle_restarts: Arc<RwLock<u64>>,
    message_tx: &mpsc::UnboundedSender<String>,
    cmd_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
    next_request_id: Arc<AtomicU32>,
    read_timeout_secs: u64,
    max_consecutive_timeouts: u32,
) -> Result<SessionEnd, Box<dyn std::error::Error + Send + Sync>> {
    debug!(url = url, "Opening feed session");

    let (ws_stream, _) = connect_async(url).await?;
    info!("Feed connected");
    *state.write() = ConnectionStatus::Connected;

    let (mut write, mut read) = ws_stream.split();

    if !initial_subscriptions.is_empty() {
        let req_id = next_request_id.fetch_add(1, Ordering::Relaxed);
        let subscribe_msg = serde_json::json!({
            "method": "subscribe",
            "params": initial_subscriptions,
            "id": req_id,
        });
        write.send(Message::Text(subscribe_msg.to_string())).await?;
        info!(count = initial_subscriptions.len(), "Subscribed to feed channels");
    }

    let mut consecutive_timeouts = 0u32;

    loop {
        tokio::select! {
            msg_result = tokio::time::timeout(Duration::from_secs(read_timeout_secs), read.next()) => {
                match msg_result {
                    Err(_) => {
                        consecutive_timeouts += 1;
                        warn!(
                            consecutive = consecutive_timeouts,
                            limit = max_consecutive_timeouts,
                            "Feed read timeout"
                        );
                        if consecutive_timeouts >= max_consecutive_timeouts {
                            // Idle-cancel: surface as a restart condition
                            *idle_restarts.write() += 1;
                            *state.write() = ConnectionStatus::Disconnected;
                            return Ok(SessionEnd::Restart);
                        }
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        consecutive_timeouts = 0;
                        *message_count.write() += 1;
                        let _ = message_tx.send(text);
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        consecutive_timeouts = 0;
                        write.send(Message::Pong(data)).await?;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {
                        consecutive_timeouts = 0;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        info!("Feed closed by server");
                        *state.write() = ConnectionStatus::Disconnected;
                        return Err("server closed connection".into());
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        *error_count.write() += 1;
                        *state.write() = ConnectionStatus::Failed;
                        return Err(e.into());
                    }
                    Ok(None) => {
                        *state.write() = ConnectionStatus::Disconnected;
                        return Err("feed stream ended".into());
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(FeedCommand::Subscribe(channels)) => {
                        let req_id = next_request_id.fetch_add(1, Ordering::Relaxed);
                        let msg = serde_json::json!({
                            "method": "subscribe",
                            "params": channels,
                            "id": req_id,
                        });
                        if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                            error!(error = %e, "Failed to send subscribe");
                        } else {
                            info!(channels = ?channels, "Subscribed");
                        }
                    }
                    Some(FeedCommand::Unsubscribe(channels)) => {
                        let req_id = next_request_id.fetch_add(1, Ordering::Relaxed);
                        let msg = serde_json::json!({
                            "method": "unsubscribe",
                            "params": channels,
                            "id": req_id,
                        });
                        if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                            error!(error = %e, "Failed to send unsubscribe");
                        } else {
                            info!(channels = ?channels, "Unsubscribed");
                        }
                    }
                    None => {
                        debug!("Feed command channel closed");
                        *state.write() = ConnectionStatus::Disconnected;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }

        // A client-side disconnect() flips the state flag
        if *state.read() == ConnectionStatus::Disconnected {
            return Ok(SessionEnd::Shutdown);
        }
    }
}
