// Message Formatter - human-readable alert text for the messaging sink
// Precision follows the price's order of magnitude so both BTC and
// sub-cent meme coins render usefully.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::core::types::{Direction, Priority, SignalKind};
use crate::alerts::telegram::DeliverySignal;

/// Render a price with magnitude-aware precision.
pub fn format_price(price: Decimal) -> String {
    let abs = price.abs();
    if abs >= dec!(1000) {
        group_thousands(&price.round_dp(0).to_string())
    } else if abs >= dec!(1) {
        price.round_dp(2).normalize().to_string()
    } else if abs >= dec!(0.01) {
        price.round_dp(4).normalize().to_string()
    } else if abs >= dec!(0.0001) {
        price.round_dp(6).normalize().to_string()
    } else {
        price.round_dp(10).normalize().to_string()
    }
}

/// Compact USD rendering: $2.4M, $800K, $950.
pub fn format_usd(amount: f64) -> String {
    let abs = amount.abs();
    if abs >= 1_000_000.0 {
        format!("${:.1}M", amount / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("${:.0}K", amount / 1_000.0)
    } else {
        format!("${:.0}", amount)
    }
}

fn group_thousands(raw: &str) -> String {
    let (sign, digits) = raw.strip_prefix('-').map_or(("", raw), |d| ("-", d));
    let mut grouped = String::new();
    let len = digits.len();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}", sign, grouped)
}

fn priority_emoji(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "🔴",
        Priority::Watch => "🟡",
        Priority::Info => "🔵",
    }
}

fn progress_bar(fraction: f64, length: usize) -> String {
    let filled = ((length as f64 * fraction).round() as usize).min(length);
    "█".repeat(filled) + &"░".repeat(length - filled)
}

/// Full alert text for one delivered signal. Stale context appends a
/// degraded marker so operators know the filter ran blind.
pub fn format_signal_message(signal: &DeliverySignal) -> String {
    let emoji = priority_emoji(signal.priority);
    let headline = match signal.kind {
        SignalKind::StopHunt => "STOP HUNT DETECTED",
        SignalKind::Accumulation => "WHALE ACCUMULATION",
        SignalKind::Distribution => "WHALE DISTRIBUTION",
        SignalKind::WhaleAccumulation => "WHALE BUYING WINDOW",
        SignalKind::WhaleDistribution => "WHALE SELLING WINDOW",
        SignalKind::VolumeSpike => "VOLUME SPIKE",
    };

    let mut lines = vec![
        format!("{} *{}* - {}", emoji, headline, signal.symbol),
        String::new(),
        signal.summary.clone(),
        String::new(),
    ];

    if signal.direction != Direction::Neutral {
        lines.push("💡 *TRADING SETUP*".to_string());
        lines.push(format!("Direction: {}", signal.direction));
        lines.push(format!("Entry: {}", format_price(signal.entry)));
        lines.push(format!("Stop: {}", format_price(signal.stop)));
        lines.push(format!("Target: {}", format_price(signal.target)));
        lines.push(String::new());
    }

    let conf_fraction = (signal.confidence / 100.0).clamp(0.0, 1.0);
    lines.push(format!(
        "🎯 Confidence: {:.0}%\n{}",
        signal.confidence,
        progress_bar(conf_fraction, 20)
    ));

    if let Some(context) = &signal.context_note {
        lines.push(format!("🌐 Context: {}", context));
    }

    if signal.degraded {
        lines.push("[degraded]".to_string());
    }

    lines.join("\n")
}
