// Alerts: formatting and the Telegram delivery sink

pub mod formatter;
pub mod telegram;

pub use formatter::{format_price, format_signal_message, format_usd};
pub use telegram::{DeliveryResult, DeliverySignal, TelegramSink};
