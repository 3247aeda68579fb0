use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type UserId = String;
pub type AccountId = String;
pub type CampaignId = String;
pub type AdId = String;

/// How long after `created_at` a stop action may still be undone.
pub const REVERT_WINDOW_MS: i64 = 5 * 60 * 1000;

// ─── Rules ──────────────────────────────────────────────────────────────────

/// Which metric a rule watches and how it is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Cost per lead, currency.
    CplLimit,
    /// Click-through rate, percent.
    MinCtr,
    /// Spend rate, currency per active hour.
    FastSpend,
    /// Spend while the ad has no leads, currency.
    SpendNoLeads,
    /// Spend today, currency.
    BudgetLimit,
    /// Impression count.
    LowImpressions,
    /// Clicks while the ad has no leads, count.
    ClicksNoLeads,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::CplLimit => "cpl_limit",
            RuleType::MinCtr => "min_ctr",
            RuleType::FastSpend => "fast_spend",
            RuleType::SpendNoLeads => "spend_no_leads",
            RuleType::BudgetLimit => "budget_limit",
            RuleType::LowImpressions => "low_impressions",
            RuleType::ClicksNoLeads => "clicks_no_leads",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied between the observed metric and the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl ConditionOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ConditionOperator::GreaterThan => ">",
            ConditionOperator::LessThan => "<",
            ConditionOperator::GreaterOrEqual => ">=",
        }
    }

    /// Compares at full precision; no rounding is applied to either side.
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            ConditionOperator::GreaterThan => observed > threshold,
            ConditionOperator::LessThan => observed < threshold,
            ConditionOperator::GreaterOrEqual => observed >= threshold,
        }
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleCondition {
    pub operator: ConditionOperator,
    pub value: f64,
}

/// What to do when a rule triggers. At least one flag must be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct RuleActions {
    #[serde(default)]
    pub stop_ad: bool,
    #[serde(default)]
    pub notify: bool,
}

impl RuleActions {
    pub fn is_empty(&self) -> bool {
        !self.stop_ad && !self.notify
    }

    /// The log action type this combination produces, `None` when nothing is selected.
    pub fn action_type(&self) -> Option<ActionType> {
        match (self.stop_ad, self.notify) {
            (true, true) => Some(ActionType::StoppedAndNotified),
            (true, false) => Some(ActionType::Stopped),
            (false, true) => Some(ActionType::Notified),
            (false, false) => None,
        }
    }
}

/// Target selection across the account → campaign → ad hierarchy.
/// A selection at a higher level always covers everything beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct RuleTargets {
    #[serde(default)]
    pub account_ids: BTreeSet<AccountId>,
    #[serde(default)]
    pub campaign_ids: BTreeSet<CampaignId>,
    #[serde(default)]
    pub ad_ids: BTreeSet<AdId>,
}

impl RuleTargets {
    pub fn is_empty(&self) -> bool {
        self.account_ids.is_empty() && self.campaign_ids.is_empty() && self.ad_ids.is_empty()
    }
}

/// A user-defined automation rule.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Rule {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub condition: RuleCondition,
    pub actions: RuleActions,
    pub targets: RuleTargets,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-supplied rule definition, used for create and update.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuleDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub condition: RuleCondition,
    pub actions: RuleActions,
    #[serde(default)]
    pub targets: RuleTargets,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_is_active() -> bool {
    true
}

// ─── Ads ────────────────────────────────────────────────────────────────────

/// Delivery status of an ad on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdStatus {
    Active,
    Paused,
    Archived,
}

impl AdStatus {
    pub fn is_delivering(&self) -> bool {
        matches!(self, AdStatus::Active)
    }
}

/// Fully-qualified reference to an ad.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct AdRef {
    pub account_id: AccountId,
    pub campaign_id: CampaignId,
    pub ad_id: AdId,
}

impl fmt::Display for AdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.campaign_id, self.ad_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdNode {
    pub id: AdId,
    pub name: String,
    pub status: AdStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CampaignNode {
    pub id: CampaignId,
    pub name: String,
    pub ads: Vec<AdNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccountNode {
    pub id: AccountId,
    pub name: String,
    pub campaigns: Vec<CampaignNode>,
}

/// A user's connected accounts as currently known to the ad platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Inventory {
    pub accounts: Vec<AccountNode>,
}

impl Inventory {
    pub fn ad_count(&self) -> usize {
        self.accounts
            .iter()
            .flat_map(|a| a.campaigns.iter())
            .map(|c| c.ads.len())
            .sum()
    }
}

/// Raw performance counters for one ad over the current stats window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct AdMetrics {
    pub spend: f64,
    pub leads: u64,
    pub clicks: u64,
    pub impressions: u64,
    /// Spend since the start of the current day.
    #[serde(default)]
    pub daily_spend: f64,
    /// Hours the ad has been delivering within the stats window.
    #[serde(default)]
    pub active_hours: f64,
}

impl AdMetrics {
    /// spend / leads, undefined without leads.
    pub fn cpl(&self) -> Option<f64> {
        (self.leads > 0).then(|| self.spend / self.leads as f64)
    }

    /// clicks / impressions × 100, undefined without impressions.
    pub fn ctr(&self) -> Option<f64> {
        (self.impressions > 0).then(|| self.clicks as f64 / self.impressions as f64 * 100.0)
    }

    /// spend / active hours, undefined when the ad has not been delivering.
    pub fn hourly_spend_rate(&self) -> Option<f64> {
        (self.active_hours > 0.0 && self.active_hours.is_finite())
            .then(|| self.spend / self.active_hours)
    }
}

/// Live state of an ad as reported by the metrics provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdSnapshot {
    pub ad_name: String,
    pub status: AdStatus,
    pub metrics: AdMetrics,
}

/// Metrics captured into the action log at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct MetricsSnapshot {
    pub spend: f64,
    pub leads: u64,
    pub cpl: Option<f64>,
    pub ctr: Option<f64>,
    pub impressions: Option<u64>,
    pub clicks: Option<u64>,
}

impl From<&AdMetrics> for MetricsSnapshot {
    fn from(m: &AdMetrics) -> Self {
        Self {
            spend: m.spend,
            leads: m.leads,
            cpl: m.cpl(),
            ctr: m.ctr(),
            impressions: Some(m.impressions),
            clicks: Some(m.clicks),
        }
    }
}

// ─── Action log ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Stopped,
    Notified,
    StoppedAndNotified,
}

impl ActionType {
    pub fn includes_stop(&self) -> bool {
        matches!(self, ActionType::Stopped | ActionType::StoppedAndNotified)
    }

    pub fn includes_notify(&self) -> bool {
        matches!(self, ActionType::Notified | ActionType::StoppedAndNotified)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionType::Stopped => "Ad stopped",
            ActionType::Notified => "Notification sent",
            ActionType::StoppedAndNotified => "Ad stopped and notification sent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Reverted,
}

/// Audit record of one action attempt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub account_id: AccountId,
    pub campaign_id: CampaignId,
    pub ad_id: AdId,
    pub ad_name: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    /// Which rule and threshold fired, plus the failure cause for failed entries.
    pub reason: String,
    pub metrics_snapshot: MetricsSnapshot,
    pub saved_amount: f64,
    pub pass_id: Option<Uuid>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub reverted_at: Option<i64>,
    /// Set when a revert was recorded but resuming the ad failed.
    pub resume_error: Option<String>,
}

impl ActionLogEntry {
    pub fn revert_deadline_ms(&self) -> i64 {
        self.created_at + REVERT_WINDOW_MS
    }

    /// An unreverted successful stop.
    pub fn is_live_stop(&self) -> bool {
        self.status == ActionStatus::Success && self.action_type.includes_stop()
    }
}

/// Filters for the log viewer. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LogFilter {
    pub action_type: Option<ActionType>,
    pub account_id: Option<AccountId>,
    pub rule_id: Option<Uuid>,
    pub status: Option<ActionStatus>,
    /// Case-insensitive substring match over ad name and reason.
    pub search_text: Option<String>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, entry: &ActionLogEntry) -> bool {
        if let Some(action_type) = self.action_type {
            if entry.action_type != action_type {
                return false;
            }
        }
        if let Some(ref account_id) = self.account_id {
            if &entry.account_id != account_id {
                return false;
            }
        }
        if let Some(rule_id) = self.rule_id {
            if entry.rule_id != rule_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(ref text) = self.search_text {
            let needle = text.trim().to_lowercase();
            if !needle.is_empty()
                && !entry.ad_name.to_lowercase().contains(&needle)
                && !entry.reason.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Result of a user-triggered undo.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevertOutcome {
    pub success: bool,
    pub entry_id: Uuid,
    pub error: Option<String>,
}

// ─── Evaluation ledger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Triggered,
    NotTriggered,
}

/// Last evaluation of a (rule, ad) pair, kept alongside the action log so a
/// restarted scheduler can resume without process memory.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EvaluationRecord {
    pub pass_id: Uuid,
    pub rule_id: Uuid,
    pub ad_id: AdId,
    pub evaluated_at: i64,
    pub outcome: EvaluationOutcome,
    /// A notification has already gone out for the current breach episode.
    #[serde(default)]
    pub notified: bool,
}

// ─── Subscription tiers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Start,
    Pro,
}

/// Limits granted by a subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PlanLimits {
    pub max_rules: usize,
    pub max_accounts: usize,
    pub auto_stop_allowed: bool,
}
