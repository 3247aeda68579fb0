use serde::{Deserialize, Serialize};

use adrules_core::types::{AdMetrics, ConditionOperator, RuleType};

/// Outcome of checking one rule condition against one metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub triggered: bool,
    pub reason: String,
    /// The metric value the threshold was compared against, `None` when undefined.
    pub observed: Option<f64>,
}

impl Evaluation {
    fn undefined(reason: impl Into<String>) -> Self {
        Self {
            triggered: false,
            reason: reason.into(),
            observed: None,
        }
    }
}

/// Pure, side-effect free evaluation of rule conditions.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Selects the metric for `rule_type` and compares it with `threshold`.
    ///
    /// Undefined metrics (CPL without leads, CTR without impressions, spend
    /// rate without delivery hours) never trigger.
    pub fn evaluate(
        &self,
        rule_type: RuleType,
        operator: ConditionOperator,
        threshold: f64,
        metrics: &AdMetrics,
    ) -> Evaluation {
        match rule_type {
            RuleType::CplLimit => match metrics.cpl() {
                Some(cpl) => compare("CPL", cpl, "", operator, threshold, ""),
                None => Evaluation::undefined("CPL undefined (no leads)"),
            },
            RuleType::MinCtr => match metrics.ctr() {
                Some(ctr) => compare("CTR", ctr, "%", operator, threshold, ""),
                None => Evaluation::undefined("CTR undefined (no impressions)"),
            },
            RuleType::FastSpend => match metrics.hourly_spend_rate() {
                Some(rate) => compare("Spend rate", rate, "/h", operator, threshold, ""),
                None => Evaluation::undefined("Spend rate undefined (no delivery hours)"),
            },
            RuleType::SpendNoLeads => {
                if metrics.leads > 0 {
                    Evaluation::undefined(format!("Ad has {} leads", metrics.leads))
                } else {
                    compare("Spend", metrics.spend, "", operator, threshold, " with no leads")
                }
            }
            RuleType::BudgetLimit => {
                compare("Daily spend", metrics.daily_spend, "", operator, threshold, "")
            }
            RuleType::LowImpressions => compare(
                "Impressions",
                metrics.impressions as f64,
                "",
                operator,
                threshold,
                "",
            ),
            RuleType::ClicksNoLeads => {
                if metrics.leads > 0 {
                    Evaluation::undefined(format!("Ad has {} leads", metrics.leads))
                } else {
                    compare(
                        "Clicks",
                        metrics.clicks as f64,
                        "",
                        operator,
                        threshold,
                        " with no leads",
                    )
                }
            }
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(
    label: &str,
    observed: f64,
    unit: &str,
    operator: ConditionOperator,
    threshold: f64,
    suffix: &str,
) -> Evaluation {
    let triggered = operator.compare(observed, threshold);
    let negation = if triggered { "" } else { "not " };
    Evaluation {
        triggered,
        reason: format!(
            "{label} {}{unit} {negation}{operator} {}{unit}{suffix}",
            format_amount(observed),
            format_amount(threshold),
        ),
        observed: Some(observed),
    }
}

/// Formats a metric for humans: integers without decimals, otherwise at most
/// two decimal places with trailing zeros removed.
pub fn format_amount(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        // `+ 0.0` folds negative zero.
        format!("{:.0}", rounded + 0.0)
    } else {
        let text = format!("{:.2}", rounded);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
