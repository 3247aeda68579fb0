//! Capabilities the engine consumes from the outside world: the ad platform
//! (inventory, metrics, stop/resume), the notification channel, and the
//! subscription tier lookup.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use adrules_core::config::TierConfig;
use adrules_core::error::PlatformError;
use adrules_core::types::{
    ActionStatus, ActionType, AdRef, AdSnapshot, Inventory, MetricsSnapshot, PlanLimits, Tier,
    UserId,
};

use crate::evaluator::format_amount;

/// Connected accounts and their campaign/ad tree for one user.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn inventory(&self, user_id: &str) -> Result<Inventory, PlatformError>;
}

/// Current delivery status and counters for an ad. `Ok(None)` means the
/// platform has no statistics for the ad yet.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn get_metrics(&self, ad: &AdRef) -> Result<Option<AdSnapshot>, PlatformError>;
}

/// Stops and resumes ad delivery on the platform.
#[async_trait]
pub trait AdController: Send + Sync {
    async fn stop(&self, ad_id: &str) -> Result<(), PlatformError>;
    async fn resume(&self, ad_id: &str) -> Result<(), PlatformError>;
}

/// Best-effort delivery of rule notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: &str, request: NotificationRequest) -> Result<(), PlatformError>;
}

/// Subscription limits for a user. Consulted when rules are created or toggled.
pub trait TierLimits: Send + Sync {
    fn limits(&self, user_id: &str) -> PlanLimits;
}

/// Payload handed to the notifier when a rule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: UserId,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub account_id: String,
    pub ad_id: String,
    pub ad_name: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub reason: String,
    pub metrics: MetricsSnapshot,
    pub saved_amount: f64,
}

impl NotificationRequest {
    /// Plain-text message body.
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Rule \"{}\" triggered", self.rule_name),
            format!("Ad: {} ({})", self.ad_name, self.ad_id),
            format!("Reason: {}", self.reason),
        ];

        match (self.action_type.includes_stop(), self.status) {
            (true, ActionStatus::Success) => {
                lines.push("Action: ad stopped".to_string());
                if self.saved_amount > 0.0 {
                    lines.push(format!("Estimated savings: {}", format_amount(self.saved_amount)));
                }
            }
            (true, _) => lines.push("Action: stopping the ad FAILED, will retry".to_string()),
            (false, _) => {}
        }

        let m = &self.metrics;
        let mut stats = vec![
            format!("spend {}", format_amount(m.spend)),
            format!("leads {}", m.leads),
        ];
        if let Some(cpl) = m.cpl {
            stats.push(format!("CPL {}", format_amount(cpl)));
        }
        if let Some(ctr) = m.ctr {
            stats.push(format!("CTR {}%", format_amount(ctr)));
        }
        if let Some(clicks) = m.clicks {
            stats.push(format!("clicks {}", clicks));
        }
        lines.push(format!("Stats: {}", stats.join(", ")));
        lines.join("\n")
    }
}

/// Writes notifications to the log instead of a chat channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, user_id: &str, request: NotificationRequest) -> Result<(), PlatformError> {
        info!(
            user_id,
            rule_id = %request.rule_id,
            ad_id = %request.ad_id,
            action_type = ?request.action_type,
            message = %request.render(),
            "Rule notification"
        );
        Ok(())
    }
}

/// In-memory notifier that captures requests, for tests and the demo binary.
#[derive(Default)]
pub struct CaptureNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failing: AtomicBool,
}

impl CaptureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for CaptureNotifier {
    async fn send(&self, _user_id: &str, request: NotificationRequest) -> Result<(), PlatformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Transport("notification channel unreachable".into()));
        }
        self.sent.lock().push(request);
        Ok(())
    }
}

/// Config-backed tier lookup; users without an assignment are on the free tier.
pub struct StaticTierLimits {
    config: TierConfig,
    assignments: DashMap<UserId, Tier>,
}

impl StaticTierLimits {
    pub fn new(config: TierConfig) -> Self {
        Self {
            config,
            assignments: DashMap::new(),
        }
    }

    pub fn assign(&self, user_id: &str, tier: Tier) {
        self.assignments.insert(user_id.to_string(), tier);
    }

    pub fn tier_of(&self, user_id: &str) -> Tier {
        self.assignments
            .get(user_id)
            .map(|t| *t.value())
            .unwrap_or(Tier::Free)
    }
}

impl TierLimits for StaticTierLimits {
    fn limits(&self, user_id: &str) -> PlanLimits {
        self.config.limits_for(self.tier_of(user_id))
    }
}
