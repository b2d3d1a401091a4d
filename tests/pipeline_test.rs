// End-to-End Pipeline Tests
//
// These exercise the full synchronous path without network connections:
//   raw frames -> normaliser -> buffers -> analyzers -> merger ->
//   validator -> scorer -> context filter -> outcome tracker
// Every step takes an explicit clock, so each scenario runs under fixed
// timestamps and is fully deterministic.
//
// Run with: cargo test --test pipeline_test

use rust_decimal_macros::dec;

use signal_hunt::core::config::ConfigManager;
use signal_hunt::core::types::{
    ContextAssessment, ContextSnapshot, Direction, OutcomeLabel, Priority, Producer,
    SignalKind, Tier, TradingSignal,
};
use signal_hunt::engine::{OutboundSignal, SignalPipeline};

// ============================================================================
// Helpers
// ============================================================================

fn pipeline() -> SignalPipeline {
    SignalPipeline::new(&ConfigManager::new(None).unwrap())
}

/// Raw liquidation frame as the vendor sends it: string numerics,
/// side 1 = long positions liquidated, 2 = short positions liquidated.
fn liq_frame(symbol: &str, price: &str, side: u8, vol_usd: &str, ts: i64) -> String {
    format!(
        r#"{{"event":"liquidation","data":{{"symbol":"{}","exName":"Binance","price":"{}","side":{},"volUsd":"{}","time":{}}}}}"#,
        symbol, price, side, vol_usd, ts
    )
}

/// Raw trade frame: side 1 = sell, 2 = buy.
fn trade_frame(symbol: &str, price: &str, side: u8, vol_usd: &str, ts: i64) -> String {
    format!(
        r#"{{"event":"trade","data":{{"symbol":"{}","exName":"Binance","price":"{}","side":{},"volUsd":"{}","time":{}}}}}"#,
        symbol, price, side, vol_usd, ts
    )
}

/// Scenario-1 trace: a $2.4M flush of longs over ~19s in the
/// 95,800-96,000 zone, then $1.2M of large buying.
fn run_cascade_trace(p: &SignalPipeline, base_ts: i64) -> Vec<OutboundSignal> {
    for i in 0..12i64 {
        let price = match i {
            0 => "96000",
            11 => "95800",
            _ => "95900",
        };
        let ts = base_ts + i * 1_700;
        p.ingest_frame(&liq_frame("BTCUSDT", price, 1, "200000", ts), ts);
    }
    for i in 0..6i64 {
        let ts = base_ts + 21_000 + i * 3_000;
        p.ingest_frame(&trade_frame("BTCUSDT", "96010.5", 2, "200000", ts), ts);
    }
    p.drain(base_ts + 41_000)
}

/// Scenario-2 trace on a tier-3 meme coin: 0.72 buy ratio with 7 large
/// buys over $2K against 1 large sell, sub-cent prices throughout.
fn run_accumulation_trace(p: &SignalPipeline, base_ts: i64) -> Vec<OutboundSignal> {
    let mut i = 0i64;
    let mut ingest = |price: &str, side: u8, vol: &str| {
        let ts = base_ts + i * 2_000;
        p.ingest_frame(&trade_frame("PEPEUSDT", price, side, vol, ts), ts);
        i += 1;
    };

    // $280K of selling: one whale, the rest retail-sized
    ingest("0.0000123", 1, "100000");
    for _ in 0..100 {
        ingest("0.0000123", 1, "1800");
    }
    // $19.5K of small buying
    for _ in 0..13 {
        ingest("0.0000123", 2, "1500");
    }
    // Seven whale buys; the last sets the reference price
    for k in 0..7 {
        let price = if k == 6 { "0.00001234" } else { "0.0000123" };
        ingest(price, 2, "100000");
    }

    let last_ts = base_ts + 120 * 2_000;
    p.drain(last_ts + 2_100)
}

// ============================================================================
// Scenario 1 - liquidation cascade with absorption
// ============================================================================

#[test]
fn test_cascade_with_buy_absorption_emits_urgent_long() {
    let p = pipeline();
    let outbound = run_cascade_trace(&p, 0);

    assert_eq!(outbound.len(), 1);
    let OutboundSignal { signal, decision } = &outbound[0];

    assert_eq!(signal.symbol, "BTCUSDT");
    assert_eq!(signal.kind, SignalKind::StopHunt);
    assert_eq!(signal.direction, Direction::Long);
    assert_eq!(signal.tier, Tier::T1);

    // Entry at the top of the hunt zone, stop below its bottom
    assert_eq!(signal.entry, dec!(96000));
    assert!(signal.stop < dec!(95800));
    assert_eq!(signal.target, signal.entry + dec!(2) * (signal.entry - signal.stop));

    // 50 + 20*min(1, 2.4M/6M) + 15*1.0 + 20 absorption = 93
    assert!(signal.confidence >= 85.0);
    assert_eq!(signal.priority, Priority::Urgent);

    // No context data yet: neutral pass-through, flagged degraded
    assert_eq!(signal.context, Some(ContextAssessment::Neutral));
    assert!(decision.stale);
    assert!(decision.deliver_to_messaging);
}

#[test]
fn test_cascade_exactly_at_threshold_stays_quiet() {
    let p = pipeline();
    // $2.0M exactly: strict greater-than must not trigger
    for i in 0..10i64 {
        let ts = i * 1_700;
        p.ingest_frame(&liq_frame("BTCUSDT", "96000", 1, "200000", ts), ts);
    }
    for i in 0..6i64 {
        let ts = 21_000 + i * 3_000;
        p.ingest_frame(&trade_frame("BTCUSDT", "96010", 2, "200000", ts), ts);
    }

    assert!(p.drain(60_000).is_empty());
}

// ============================================================================
// Scenario 2 - order-flow accumulation on a tier-3 symbol
// ============================================================================

#[test]
fn test_accumulation_on_tier3_symbol_with_bias() {
    let p = pipeline();
    let outbound = run_accumulation_trace(&p, 0);

    assert_eq!(outbound.len(), 1);
    let signal = &outbound[0].signal;

    assert_eq!(signal.symbol, "PEPEUSDT");
    assert_eq!(signal.kind, SignalKind::Accumulation);
    assert_eq!(signal.direction, Direction::Long);
    assert_eq!(signal.tier, Tier::T3);

    // Raw ~77.2 plus the +4 tier-3 bias
    assert!(signal.confidence >= 70.0);
    assert!(matches!(signal.priority, Priority::Watch | Priority::Urgent));

    // Entry is the last trade price with sub-cent precision intact
    assert_eq!(signal.entry, dec!(0.00001234));
}

// ============================================================================
// Scenario 3 - unfavorable context suppresses messaging only
// ============================================================================

#[test]
fn test_unfavorable_context_suppresses_messaging() {
    let p = pipeline();
    let base_ts = 1_000_000;

    // Fresh snapshot: crowded longs (+0.03% funding) into +8% OI build-up
    p.context.add_snapshot(ContextSnapshot {
        symbol: "PEPE".to_string(),
        ts: base_ts + 235_000,
        open_interest_usd: 5.0e8,
        previous_oi_usd: 4.63e8,
        oi_change_pct: 8.0,
        funding_rate: 0.0003,
        source_exchange: "aggregated".to_string(),
    });

    let without_context = {
        let clean = pipeline();
        run_accumulation_trace(&clean, base_ts)[0].signal.confidence
    };

    let outbound = run_accumulation_trace(&p, base_ts);
    assert_eq!(outbound.len(), 1);
    let OutboundSignal { signal, decision } = &outbound[0];

    assert_eq!(signal.context, Some(ContextAssessment::Unfavorable));
    assert!(!decision.deliver_to_messaging); // dashboard still receives it
    assert!((without_context - signal.confidence - 10.0).abs() < 1e-9);
}

// ============================================================================
// Scenario 4 - global hourly rate cap
// ============================================================================

#[test]
fn test_hourly_rate_cap_across_symbols() {
    let p = pipeline();
    let mut delivered = 0;

    // 60 qualifying cascades across 10 tier-3 symbols in 55 minutes
    for k in 0..60i64 {
        let symbol = format!("RATE{}USDT", k % 10);
        let base_ts = k * 55_000;

        for i in 0..6i64 {
            let ts = base_ts + i * 1_000;
            p.ingest_frame(&liq_frame(&symbol, "1.25", 1, "10000", ts), ts);
        }
        // Absorption window closes with no opposite flow; tick resolves it
        p.tick_symbol(&symbol, base_ts + 36_000);
        delivered += p.drain(base_ts + 39_000).len();
    }

    assert_eq!(delivered, 50);

    let counters = p.counters();
    assert_eq!(counters["validator"]["approved"], 50);
    assert_eq!(counters["validator"]["dropped_rate_limited"], 10);
}

// ============================================================================
// Scenario 5 - outcome WIN feeds the scorer
// ============================================================================

#[test]
fn test_outcome_win_updates_producer_record() {
    let p = pipeline();
    let t0 = 1_000_000;

    let signal = TradingSignal {
        id: uuid::Uuid::new_v4(),
        symbol: "BTCUSDT".to_string(),
        kind: SignalKind::StopHunt,
        direction: Direction::Long,
        entry: dec!(100),
        stop: dec!(95),
        target: dec!(110),
        confidence: 90.0,
        tier: Tier::T1,
        priority: Priority::Urgent,
        context: None,
        sources: vec![Producer::StopHunt],
        metadata: serde_json::Value::Null,
        ts: t0,
    };
    p.track(&signal);

    // 15 minutes later the market trades at 106: 60% of the way
    let check_ts = t0 + 900_000;
    p.ingest_frame(
        &trade_frame("BTCUSDT", "106", 2, "50000", check_ts - 5_000),
        check_ts - 5_000,
    );

    let decided = p.due_outcomes(check_ts);
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].outcome.label, OutcomeLabel::Win);
    assert!(decided[0].outcome.pct_to_target >= 0.5);

    let record = p.scorer.producer_record(Producer::StopHunt);
    assert_eq!(record.wins, 1);
    assert_eq!(record.losses, 0);
}

// ============================================================================
// Scenario 6 - monotonicity under replayed/old frames
// ============================================================================

#[test]
fn test_old_frames_after_restart_are_dropped_not_fatal() {
    let p = pipeline();

    p.ingest_frame(&trade_frame("BTCUSDT", "96000", 2, "10000", 100_000), 100_000);
    p.ingest_frame(&trade_frame("BTCUSDT", "96010", 2, "10000", 102_000), 102_000);

    // A restarted upstream replays frames more than 2s older than the tail
    p.ingest_frame(&trade_frame("BTCUSDT", "95990", 2, "10000", 95_000), 103_000);
    p.ingest_frame(&liq_frame("BTCUSDT", "95990", 1, "10000", 50_000), 103_000);
    p.ingest_frame(&liq_frame("BTCUSDT", "95991", 1, "10000", 103_000), 103_000);
    p.ingest_frame(&liq_frame("BTCUSDT", "95990", 1, "10000", 50_000), 104_000);

    let stats = p.buffers.get_stats();
    assert_eq!(stats.dropped_ordering_trades, 1);
    assert_eq!(stats.dropped_ordering_liquidations, 1);
    // In-order data was kept (the first old liquidation had no tail to
    // violate, so it was admitted)
    assert_eq!(stats.total_trades, 2);
    assert_eq!(stats.total_liquidations, 2);
}

// ============================================================================
// Cross-cutting properties
// ============================================================================

#[test]
fn test_replayed_trace_produces_no_second_signal() {
    let p = pipeline();

    let first = run_cascade_trace(&p, 0);
    assert_eq!(first.len(), 1);

    // The same burst again one minute later, well inside cooldown/dedup
    let second = run_cascade_trace(&p, 60_000);
    assert!(second.is_empty());

    let counters = p.counters();
    assert_eq!(counters["validator"]["approved"], 1);
}

#[test]
fn test_fixed_clock_trace_is_deterministic() {
    let a = run_cascade_trace(&pipeline(), 0);
    let b = run_cascade_trace(&pipeline(), 0);

    assert_eq!(a.len(), b.len());
    let (a, b) = (&a[0].signal, &b[0].signal);
    assert_eq!(a.symbol, b.symbol);
    assert_eq!(a.kind, b.kind);
    assert_eq!(a.direction, b.direction);
    assert_eq!(a.entry, b.entry);
    assert_eq!(a.stop, b.stop);
    assert_eq!(a.target, b.target);
    assert_eq!(a.confidence, b.confidence);
    assert_eq!(a.priority, b.priority);
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn test_confidence_bounds_and_priority_consistency() {
    let p = pipeline();
    let outbound = run_cascade_trace(&p, 0);

    for OutboundSignal { signal, .. } in &outbound {
        assert!((0.0..=100.0).contains(&signal.confidence));
        let expected = if signal.confidence >= 85.0 {
            Priority::Urgent
        } else if signal.confidence >= 70.0 {
            Priority::Watch
        } else {
            Priority::Info
        };
        assert_eq!(signal.priority, expected);
    }
}

#[test]
fn test_unknown_symbol_runs_with_tier3_thresholds() {
    let p = pipeline();

    // $60K of one-sided liquidations would never move a tier-1 symbol,
    // but clears the $50K tier-3 bar for a symbol not in any tier list
    for i in 0..6i64 {
        let ts = i * 1_000;
        p.ingest_frame(&liq_frame("NEWCOINUSDT", "0.5", 1, "10000", ts), ts);
    }
    p.tick_symbol("NEWCOINUSDT", 36_000);

    let outbound = p.drain(39_000);
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].signal.tier, Tier::T3);
}

#[test]
fn test_empty_pipeline_drains_empty() {
    let p = pipeline();
    assert!(p.drain(1_000_000).is_empty());
    assert!(p.due_outcomes(1_000_000).is_empty());
    assert!(p.buffers.snapshot_trades("GHOSTUSDT", 0).is_empty());
}
