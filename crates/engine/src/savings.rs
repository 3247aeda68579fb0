//! Estimated money saved by stopping an ad.

use adrules_core::types::{AdMetrics, AdRef, RuleType};

/// Pluggable estimate of the spend a stop action avoids. Implementations
/// must return a finite, non-negative amount.
pub trait SavingsPolicy: Send + Sync {
    fn estimate(&self, ad: &AdRef, rule_type: RuleType, metrics: &AdMetrics) -> f64;
}

/// Projects the ad's current hourly spend rate over a fixed horizon.
///
/// The rate is spend per delivery hour when the platform reports active
/// hours, otherwise today's spend spread over a full day.
#[derive(Debug, Clone, Copy)]
pub struct LookaheadSavings {
    pub lookahead_hours: f64,
}

impl LookaheadSavings {
    pub fn new(lookahead_hours: f64) -> Self {
        Self { lookahead_hours }
    }

    fn hourly_rate(metrics: &AdMetrics) -> f64 {
        metrics
            .hourly_spend_rate()
            .unwrap_or(metrics.daily_spend / 24.0)
    }
}

impl Default for LookaheadSavings {
    fn default() -> Self {
        Self::new(24.0)
    }
}

impl SavingsPolicy for LookaheadSavings {
    fn estimate(&self, _ad: &AdRef, _rule_type: RuleType, metrics: &AdMetrics) -> f64 {
        let projected = Self::hourly_rate(metrics) * self.lookahead_hours;
        if !projected.is_finite() || projected <= 0.0 {
            return 0.0;
        }
        (projected * 100.0).round() / 100.0
    }
}
