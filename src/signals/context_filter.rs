// Market-Context Filter - OI & funding alignment gate
// An adjustment by default, a gate only in strict mode.

use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::core::config::MarketContextConfig;
use crate::core::types::{ContextAssessment, Direction, TradingSignal};
use crate::layer2::context::{to_base_symbol, ContextBuffer};

#[derive(Debug, Clone)]
pub struct FilterDecision {
    pub assessment: ContextAssessment,
    pub deliver_to_messaging: bool,
    pub confidence_adjustment: f64,
    pub stale: bool,
    pub reason: String,
}

impl fmt::Display for FilterDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FilterDecision({}, deliver={}, adj={:+.0})",
            self.assessment, self.deliver_to_messaging, self.confidence_adjustment
        )
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FilterStats {
    pub evaluated: u64,
    pub favorable: u64,
    pub neutral: u64,
    pub unfavorable: u64,
    pub stale_or_missing: u64,
    pub messaging_suppressed: u64,
}

/// Evaluates signals against the freshest OI/funding snapshot for their
/// symbol. Never fails: missing or stale context degrades to neutral.
pub struct MarketContextFilter {
    config: MarketContextConfig,
    buffer: Arc<ContextBuffer>,
    stats: parking_lot::Mutex<FilterStats>,
}

impl MarketContextFilter {
    pub fn new(config: MarketContextConfig, buffer: Arc<ContextBuffer>) -> Self {
        Self {
            config,
            buffer,
            stats: parking_lot::Mutex::new(FilterStats::default()),
        }
    }

    pub fn evaluate(&self, signal: &TradingSignal, now_ms: i64) -> FilterDecision {
        let mut stats = self.stats.lock();
        stats.evaluated += 1;

        if !self.config.enabled {
            stats.neutral += 1;
            return self.decide(ContextAssessment::Neutral, 0.0, false, "context filter disabled".to_string(), &mut stats);
        }

        let base = to_base_symbol(&signal.symbol);
        let max_age_ms = self.config.max_age_secs as i64 * 1_000;

        let snapshot = match self.buffer.latest(base) {
            Some(s) if now_ms - s.ts <= max_age_ms => s,
            _ => {
                stats.stale_or_missing += 1;
                stats.neutral += 1;
                return self.decide(
                    ContextAssessment::Neutral,
                    0.0,
                    true,
                    "no fresh OI/funding data".to_string(),
                    &mut stats,
                );
            }
        };

        let funding = snapshot.funding_rate;
        // Interpolated 1h lookback from the ring; the poller's own
        // candle-to-candle change is the fallback.
        let tolerance_ms = 2 * self.config.poll_interval_secs as i64 * 1_000;
        let oi_change = self
            .buffer
            .oi_change_1h_pct(base, now_ms, tolerance_ms)
            .unwrap_or(snapshot.oi_change_pct);

        let assessment = assess(
            signal.direction,
            funding,
            oi_change,
            self.config.funding_hi,
            self.config.funding_lo,
            self.config.oi_change_threshold_pct,
        );

        match assessment {
            ContextAssessment::Favorable => stats.favorable += 1,
            ContextAssessment::Neutral => stats.neutral += 1,
            ContextAssessment::Unfavorable => stats.unfavorable += 1,
        }

        let adjustment = if !self.config.confidence_adjust {
            0.0
        } else {
            match assessment {
                ContextAssessment::Favorable => 5.0,
                ContextAssessment::Unfavorable => -10.0,
                ContextAssessment::Neutral => {
                    // Partial credit when funding alone leans the right way
                    let leaning = match signal.direction {
                        Direction::Long => funding <= -self.config.funding_lo,
                        Direction::Short => funding >= self.config.funding_lo,
                        Direction::Neutral => false,
                    };
                    if leaning {
                        2.0
                    } else {
                        0.0
                    }
                }
            }
        };

        let reason = format!(
            "funding {:+.4}% | OI {:+.1}% 1h",
            funding * 100.0,
            oi_change
        );

        self.decide(assessment, adjustment, false, reason, &mut stats)
    }

    fn decide(
        &self,
        assessment: ContextAssessment,
        adjustment: f64,
        stale: bool,
        reason: String,
        stats: &mut FilterStats,
    ) -> FilterDecision {
        let deliver = match self.config.filter_mode.as_str() {
            "strict" => assessment == ContextAssessment::Favorable,
            "permissive" => true,
            _ => assessment != ContextAssessment::Unfavorable,
        };
        if !deliver {
            stats.messaging_suppressed += 1;
        }

        info!(
            assessment = %assessment,
            deliver = deliver,
            adjustment = adjustment,
            reason = %reason,
            "Context filter decision"
        );

        FilterDecision {
            assessment,
            deliver_to_messaging: deliver,
            confidence_adjustment: adjustment,
            stale,
            reason,
        }
    }

    pub fn get_stats(&self) -> FilterStats {
        self.stats.lock().clone()
    }
}

/// Crowding logic: a rising-OI market where funding shows the signal's own
/// side already crowded is unfavorable; counter-side crowding with rising
/// OI is favorable. Everything else is neutral.
fn assess(
    direction: Direction,
    funding: f64,
    oi_change_pct: f64,
    funding_hi: f64,
    funding_lo: f64,
    oi_thresh: f64,
) -> ContextAssessment {
    let oi_building = oi_change_pct >= oi_thresh;

    match direction {
        Direction::Long => {
            if funding <= -funding_lo && oi_building {
                ContextAssessment::Favorable
            } else if funding >= funding_hi && oi_building {
                ContextAssessment::Unfavorable
            } else {
                ContextAssessment::Neutral
            }
        }
        Direction::Short => {
            if funding >= funding_lo && oi_building {
                ContextAssessment::Favorable
            } else if funding <= -funding_hi && oi_building {
                ContextAssessment::Unfavorable
            } else {
                ContextAssessment::Neutral
            }
        }
        Direction::Neutral => ContextAssessment::Neutral,
    }
}
