//! Performs a triggered rule's action against one ad and writes the audit
//! entry. Also owns the bounded-window revert path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use adrules_core::clock::Clock;
use adrules_core::config::EngineConfig;
use adrules_core::error::{EngineError, EngineResult};
use adrules_core::types::{
    ActionLogEntry, ActionStatus, AdMetrics, AdRef, MetricsSnapshot, Rule, REVERT_WINDOW_MS,
};

use crate::action_log::ActionLogStore;
use crate::collaborators::{AdController, NotificationRequest, Notifier};
use crate::savings::{LookaheadSavings, SavingsPolicy};

/// The ad a triggered rule acts on, with the name shown in logs and messages.
#[derive(Debug, Clone)]
pub struct ActionTarget {
    pub ad: AdRef,
    pub ad_name: String,
}

#[derive(Clone)]
pub struct ActionExecutor {
    controller: Arc<dyn AdController>,
    notifier: Arc<dyn Notifier>,
    log: Arc<dyn ActionLogStore>,
    savings: Arc<dyn SavingsPolicy>,
    clock: Arc<dyn Clock>,
    controller_timeout: Duration,
    notifier_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        config: &EngineConfig,
        controller: Arc<dyn AdController>,
        notifier: Arc<dyn Notifier>,
        log: Arc<dyn ActionLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            controller,
            notifier,
            log,
            savings: Arc::new(LookaheadSavings::new(config.savings_lookahead_hours)),
            clock,
            controller_timeout: Duration::from_millis(config.controller_timeout_ms),
            notifier_timeout: Duration::from_millis(config.notifier_timeout_ms),
        }
    }

    pub fn with_savings_policy(mut self, savings: Arc<dyn SavingsPolicy>) -> Self {
        self.savings = savings;
        self
    }

    /// Runs the rule's configured action and appends exactly one log entry.
    ///
    /// A failed or timed-out stop still produces an entry, with
    /// `status = failed` and the cause appended to the reason; the returned
    /// `Ok` carries that entry. Only a store failure or a rule without any
    /// action returns `Err`; a stop that succeeded but could not be logged is
    /// rolled back with a resume before the error is returned.
    pub async fn execute(
        &self,
        rule: &Rule,
        target: &ActionTarget,
        reason: &str,
        metrics: &AdMetrics,
        pass_id: Option<Uuid>,
    ) -> EngineResult<ActionLogEntry> {
        let action_type = rule.actions.action_type().ok_or_else(|| {
            EngineError::RuleMisconfigured(format!("rule {} has no action selected", rule.id))
        })?;
        let ad_id = target.ad.ad_id.as_str();

        let mut status = ActionStatus::Success;
        let mut saved_amount = 0.0;
        let mut reason = reason.to_string();

        if action_type.includes_stop() {
            match self.stop(ad_id).await {
                Ok(()) => {
                    saved_amount = self.savings.estimate(&target.ad, rule.rule_type, metrics);
                }
                Err(err) => {
                    warn!(rule_id = %rule.id, ad_id, error = %err, "Stop action failed");
                    status = ActionStatus::Failed;
                    reason = format!("{reason}; stop failed: {err}");
                }
            }
        }

        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            user_id: rule.user_id.clone(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            account_id: target.ad.account_id.clone(),
            campaign_id: target.ad.campaign_id.clone(),
            ad_id: ad_id.to_string(),
            ad_name: target.ad_name.clone(),
            action_type,
            status,
            reason,
            metrics_snapshot: MetricsSnapshot::from(metrics),
            saved_amount,
            pass_id,
            created_at: self.clock.now_ms(),
            reverted_at: None,
            resume_error: None,
        };
        let entry = match self.log.append(entry).await {
            Ok(entry) => entry,
            Err(err) => {
                // An unrecorded stop cannot be reverted or explained; undo it.
                if status == ActionStatus::Success && action_type.includes_stop() {
                    self.undo_unrecorded_stop(rule, ad_id).await;
                }
                return Err(err);
            }
        };

        metrics::counter!(
            "engine.actions",
            "action_type" => action_type.label(),
            "status" => if status == ActionStatus::Success { "success" } else { "failed" }
        )
        .increment(1);
        if status == ActionStatus::Failed {
            metrics::counter!("engine.action_failures").increment(1);
        }

        if action_type.includes_notify() {
            self.notify(&entry).await;
        }

        info!(
            entry_id = %entry.id,
            rule_id = %rule.id,
            ad_id,
            action = action_type.label(),
            ?status,
            saved_amount,
            "Rule action executed"
        );
        Ok(entry)
    }

    /// Undoes a successful stop within [`REVERT_WINDOW_MS`] of its creation.
    ///
    /// The entry is marked reverted before the ad is resumed. If resuming
    /// fails the entry keeps `status = reverted`, records the resume error for
    /// reconciliation, and the caller gets `ActionExecutionFailed`.
    pub async fn revert(&self, entry_id: Uuid, user_id: &str) -> EngineResult<ActionLogEntry> {
        let entry = self
            .log
            .get(entry_id)
            .await?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("action log entry {entry_id}")))?;

        if entry.status == ActionStatus::Reverted {
            return Err(EngineError::AlreadyReverted(entry_id));
        }
        if !entry.action_type.includes_stop() {
            return Err(EngineError::NotRevertible(
                "notification-only actions have nothing to undo".into(),
            ));
        }
        if entry.status == ActionStatus::Failed {
            return Err(EngineError::NotRevertible(
                "the stop action failed, nothing to undo".into(),
            ));
        }
        let now = self.clock.now_ms();
        if now > entry.revert_deadline_ms() {
            return Err(EngineError::NotRevertible(format!(
                "revert window of {} minutes has expired",
                REVERT_WINDOW_MS / 60_000
            )));
        }

        let reverted = self.log.mark_reverted(entry_id, now).await?;

        match self.resume(&entry.ad_id).await {
            Ok(()) => {
                info!(entry_id = %entry_id, ad_id = %entry.ad_id, "Stop action reverted");
                Ok(reverted)
            }
            Err(err) => {
                warn!(
                    entry_id = %entry_id,
                    ad_id = %entry.ad_id,
                    error = %err,
                    "Revert recorded but resume failed"
                );
                self.log.record_resume_failure(entry_id, &err.to_string()).await?;
                Err(EngineError::ActionExecutionFailed(format!(
                    "ad {} was marked reverted but resuming it failed: {err}",
                    entry.ad_id
                )))
            }
        }
    }

    async fn stop(&self, ad_id: &str) -> EngineResult<()> {
        match timeout(self.controller_timeout, self.controller.stop(ad_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(EngineError::ActionExecutionFailed(err.to_string())),
            Err(_) => Err(self.timed_out("stop", self.controller_timeout)),
        }
    }

    async fn undo_unrecorded_stop(&self, rule: &Rule, ad_id: &str) {
        match self.resume(ad_id).await {
            Ok(()) => warn!(
                rule_id = %rule.id,
                ad_id,
                "Action log append failed, stop rolled back"
            ),
            Err(err) => error!(
                rule_id = %rule.id,
                ad_id,
                error = %err,
                "Action log append failed and the stop could not be rolled back"
            ),
        }
        metrics::counter!("engine.stop_rollbacks").increment(1);
    }

    async fn resume(&self, ad_id: &str) -> EngineResult<()> {
        match timeout(self.controller_timeout, self.controller.resume(ad_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(EngineError::ActionExecutionFailed(err.to_string())),
            Err(_) => Err(self.timed_out("resume", self.controller_timeout)),
        }
    }

    async fn notify(&self, entry: &ActionLogEntry) {
        let request = NotificationRequest {
            user_id: entry.user_id.clone(),
            rule_id: entry.rule_id,
            rule_name: entry.rule_name.clone(),
            account_id: entry.account_id.clone(),
            ad_id: entry.ad_id.clone(),
            ad_name: entry.ad_name.clone(),
            action_type: entry.action_type,
            status: entry.status,
            reason: entry.reason.clone(),
            metrics: entry.metrics_snapshot,
            saved_amount: entry.saved_amount,
        };
        match timeout(
            self.notifier_timeout,
            self.notifier.send(&entry.user_id, request),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(entry_id = %entry.id, error = %err, "Notification delivery failed");
            }
            Err(_) => {
                warn!(
                    entry_id = %entry.id,
                    timeout_ms = self.notifier_timeout.as_millis() as u64,
                    "Notification delivery timed out"
                );
            }
        }
    }

    fn timed_out(&self, operation: &str, after: Duration) -> EngineError {
        EngineError::Timeout {
            operation: operation.to_string(),
            timeout_ms: after.as_millis() as u64,
        }
    }
}
