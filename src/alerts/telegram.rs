// Telegram Sink - queued delivery with bounded retries
// The sink owns formatting and transport; correlation is by signal id.

use rust_decimal::Decimal;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::formatter::format_signal_message;
use crate::core::config::TelegramConfig;
use crate::core::types::{ContextAssessment, Direction, Priority, SignalKind};

/// Structured handoff from the core to the messaging sink.
#[derive(Debug, Clone)]
pub struct DeliverySignal {
    pub signal_id: Uuid,
    pub symbol: String,
    pub kind: SignalKind,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64,
    pub priority: Priority,
    pub context: Option<ContextAssessment>,
    pub context_note: Option<String>,
    pub summary: String,
    pub degraded: bool,
    pub ts: i64,
}

/// Outcome of one delivery attempt chain, reported back to the engine so
/// failed signals can be marked in storage.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub signal_id: Uuid,
    pub delivered: bool,
}

/// Queued Telegram sender. Each signal gets a bounded retry chain
/// (1/2/4s backoff) under a total per-signal timeout; exhaustion marks
/// the signal delivery-failed but never blocks the pipeline.
pub struct TelegramSink {
    sender: mpsc::UnboundedSender<DeliverySignal>,
    worker: Option<JoinHandle<()>>,
}

impl TelegramSink {
    pub fn new(config: TelegramConfig, results_tx: mpsc::UnboundedSender<DeliveryResult>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(telegram_worker(config, receiver, results_tx));
        Self {
            sender,
            worker: Some(worker),
        }
    }

    /// Enqueue a signal for delivery. Never blocks.
    pub fn deliver(&self, signal: DeliverySignal) {
        if self.sender.send(signal).is_err() {
            warn!("Telegram sink channel closed");
        }
    }

    /// Close the queue and hand back the worker so the caller can flush
    /// with a bounded timeout during shutdown.
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        drop(self.sender);
        self.worker.take()
    }
}

async fn telegram_worker(
    config: TelegramConfig,
    mut receiver: mpsc::UnboundedReceiver<DeliverySignal>,
    results_tx: mpsc::UnboundedSender<DeliveryResult>,
) {
    let bot = Bot::new(&config.bot_token);
    let chat_id = ChatId(config.chat_id);

    info!(chat_id = config.chat_id, "Telegram sink started");

    while let Some(signal) = receiver.recv().await {
        let signal_id = signal.signal_id;
        let text = format_signal_message(&signal);

        let delivered = tokio::time::timeout(
            Duration::from_secs(config.delivery_timeout_secs),
            send_with_retries(&bot, chat_id, &text, config.max_attempts),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(signal_id = %signal_id, "Telegram delivery timed out");
            false
        });

        let _ = results_tx.send(DeliveryResult {
            signal_id,
            delivered,
        });
    }

    info!("Telegram sink drained");
}

/// Retry chain with exponential backoff (1s, 2s, 4s, ...).
async fn send_with_retries(bot: &Bot, chat_id: ChatId, text: &str, max_attempts: u32) -> bool {
    for attempt in 0..max_attempts {
        match bot.send_message(chat_id, text).await {
            Ok(_) => return true,
            Err(e) => {
                error!(
                    attempt = attempt + 1,
                    max = max_attempts,
                    error = %e,
                    "Telegram send failed"
                );
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn delivery() -> DeliverySignal {
        DeliverySignal {
            signal_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence: 93.0,
            priority: Priority::Urgent,
            context: None,
            context_note: None,
            summary: "cascade".to_string(),
            degraded: false,
            ts: 0,
        }
    }

    #[tokio::test]
    async fn test_close_drains_worker() {
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let config = TelegramConfig {
            enabled: true,
            bot_token: "000:invalid".to_string(),
            chat_id: 1,
            delivery_timeout_secs: 1,
            max_attempts: 1,
        };
        let sink = TelegramSink::new(config, results_tx);
        sink.deliver(delivery());

        let worker = sink.close().unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(10), worker).await;

        // The invalid token cannot deliver; the result still arrives
        let result = results_rx.try_recv().expect("delivery result");
        assert!(!result.delivered);
    }
}
