//! Pass orchestration: for every active rule, resolve targets, fetch metrics,
//! evaluate, de-duplicate and dispatch to the executor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use adrules_core::clock::Clock;
use adrules_core::config::EngineConfig;
use adrules_core::error::{EngineError, EngineResult, PlatformError};
use adrules_core::types::{
    ActionLogEntry, ActionStatus, AdId, AdRef, AdSnapshot, EvaluationOutcome, EvaluationRecord,
    LogFilter, RevertOutcome, Rule, UserId,
};

use crate::action_log::ActionLogStore;
use crate::collaborators::{AdController, InventorySource, MetricsProvider, Notifier};
use crate::evaluator::ConditionEvaluator;
use crate::executor::{ActionExecutor, ActionTarget};
use crate::resolver::TargetResolver;
use crate::rules::RuleRegistry;
use crate::savings::SavingsPolicy;
use crate::state_machine::{PairState, PairStateMachine};

/// External capabilities the engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn InventorySource>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub controller: Arc<dyn AdController>,
    pub notifier: Arc<dyn Notifier>,
    pub log: Arc<dyn ActionLogStore>,
    pub clock: Arc<dyn Clock>,
}

/// Why a pair ended the pass without an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotTriggered,
    /// The ad is paused or archived and no live stop of ours explains it.
    NotDelivering,
    /// The ad is already stopped; an unreverted stop entry may exist.
    AlreadyStopped,
    /// A notify-only rule already notified during this breach episode.
    AlreadyNotified,
    MetricsUnavailable,
    StaleTarget,
}

/// Final state of one (rule, ad) pair in a pass.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PairOutcome {
    pub rule_id: Uuid,
    pub ad_id: AdId,
    pub state: PairState,
    pub triggered: bool,
    pub skip_reason: Option<SkipReason>,
    pub entry_id: Option<Uuid>,
    pub action_status: Option<ActionStatus>,
    pub reason: Option<String>,
}

/// Summary of one pass over all active rules.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: i64,
    pub finished_at: i64,
    pub rules_considered: usize,
    pub rules_skipped: usize,
    pub pairs_evaluated: usize,
    pub triggered: usize,
    pub acted: usize,
    pub deduplicated: usize,
    pub not_delivering: usize,
    pub metrics_unavailable: usize,
    pub action_failures: usize,
    pub outcomes: Vec<PairOutcome>,
}

impl PassReport {
    fn new(pass_id: Uuid, started_at: i64) -> Self {
        Self {
            pass_id,
            started_at,
            finished_at: started_at,
            rules_considered: 0,
            rules_skipped: 0,
            pairs_evaluated: 0,
            triggered: 0,
            acted: 0,
            deduplicated: 0,
            not_delivering: 0,
            metrics_unavailable: 0,
            action_failures: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: PairOutcome) {
        self.pairs_evaluated += 1;
        if outcome.triggered {
            self.triggered += 1;
        }
        match outcome.skip_reason {
            Some(SkipReason::AlreadyStopped | SkipReason::AlreadyNotified) => {
                self.deduplicated += 1
            }
            Some(SkipReason::NotDelivering) => self.not_delivering += 1,
            Some(SkipReason::MetricsUnavailable) => self.metrics_unavailable += 1,
            Some(SkipReason::NotTriggered | SkipReason::StaleTarget) | None => {}
        }
        if outcome.state == PairState::Acted {
            self.acted += 1;
            if outcome.action_status == Some(ActionStatus::Failed) {
                self.action_failures += 1;
            }
        }
        self.outcomes.push(outcome);
    }
}

/// Scheduler-facing entry point. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct RuleEngine {
    config: Arc<EngineConfig>,
    rules: Arc<RuleRegistry>,
    inventory: Arc<dyn InventorySource>,
    metrics: Arc<dyn MetricsProvider>,
    log: Arc<dyn ActionLogStore>,
    clock: Arc<dyn Clock>,
    executor: ActionExecutor,
    evaluator: ConditionEvaluator,
    resolver: TargetResolver,
    ad_locks: Arc<DashMap<AdId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.len())
            .field("ad_locks", &self.ad_locks.len())
            .finish()
    }
}

impl RuleEngine {
    pub fn new(config: EngineConfig, rules: Arc<RuleRegistry>, deps: Collaborators) -> Self {
        let executor = ActionExecutor::new(
            &config,
            deps.controller,
            deps.notifier,
            deps.log.clone(),
            deps.clock.clone(),
        );
        Self {
            config: Arc::new(config),
            rules,
            inventory: deps.inventory,
            metrics: deps.metrics,
            log: deps.log,
            clock: deps.clock,
            executor,
            evaluator: ConditionEvaluator::new(),
            resolver: TargetResolver::new(),
            ad_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_savings_policy(mut self, savings: Arc<dyn SavingsPolicy>) -> Self {
        self.executor = self.executor.with_savings_policy(savings);
        self
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One pass over every active rule of every user.
    ///
    /// Failures are contained per (rule, ad) pair. Only a store error aborts
    /// the pass, in which case outstanding evaluations are cancelled and the
    /// error is returned for the next scheduled cycle to retry.
    pub async fn run_pass(&self) -> EngineResult<PassReport> {
        let pass_id = Uuid::new_v4();
        let timer = Instant::now();
        let mut report = PassReport::new(pass_id, self.clock.now_ms());

        let rules = self.rules.active_rules();
        report.rules_considered = rules.len();
        info!(%pass_id, rules = rules.len(), "Rule pass started");

        let mut by_user: BTreeMap<UserId, Vec<Rule>> = BTreeMap::new();
        for rule in rules {
            if rule.actions.is_empty() || rule.targets.is_empty() {
                warn!(rule_id = %rule.id, "Skipping misconfigured rule (no actions or targets)");
                report.rules_skipped += 1;
                continue;
            }
            by_user.entry(rule.user_id.clone()).or_default().push(rule);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_evaluations.max(1)));
        let mut tasks: JoinSet<EngineResult<PairOutcome>> = JoinSet::new();

        for (user_id, user_rules) in by_user {
            let inventory = match timeout(
                self.inventory_timeout(),
                self.inventory.inventory(&user_id),
            )
            .await
            {
                Ok(Ok(inventory)) => inventory,
                Ok(Err(err)) => {
                    warn!(%pass_id, user_id = %user_id, error = %err, "Inventory fetch failed, skipping user");
                    report.rules_skipped += user_rules.len();
                    continue;
                }
                Err(_) => {
                    warn!(%pass_id, user_id = %user_id, "Inventory fetch timed out, skipping user");
                    report.rules_skipped += user_rules.len();
                    continue;
                }
            };

            for rule in user_rules {
                let resolution = self.resolver.resolve(&rule.targets, &inventory);
                if !resolution.stale.is_empty() {
                    debug!(rule_id = %rule.id, stale = ?resolution.stale, "Dropping stale targets");
                }
                let rule = Arc::new(rule);
                for ad in resolution.ads {
                    let engine = self.clone();
                    let rule = rule.clone();
                    let semaphore = semaphore.clone();
                    tasks.spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|e| EngineError::Internal(e.into()))?;
                        engine.evaluate_pair(pass_id, &rule, ad).await
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(err)) if err.is_fatal() => {
                    error!(%pass_id, error = %err, "Action log unavailable, aborting pass");
                    // Queued pairs never start; in-flight ones run to completion so
                    // a stop is never cut off between the platform call and the log.
                    semaphore.close();
                    while tasks.join_next().await.is_some() {}
                    self.prune_ad_locks();
                    metrics::counter!("engine.passes", "result" => "aborted").increment(1);
                    return Err(err);
                }
                Ok(Err(err)) => {
                    warn!(%pass_id, error = %err, "Pair evaluation failed");
                }
                Err(join_err) => {
                    error!(%pass_id, error = %join_err, "Evaluation task did not complete");
                }
            }
        }

        report
            .outcomes
            .sort_by(|a, b| a.rule_id.cmp(&b.rule_id).then_with(|| a.ad_id.cmp(&b.ad_id)));
        report.finished_at = self.clock.now_ms();
        self.prune_ad_locks();

        metrics::counter!("engine.passes", "result" => "completed").increment(1);
        metrics::histogram!("engine.pass_duration_ms").record(timer.elapsed().as_millis() as f64);
        info!(
            %pass_id,
            pairs = report.pairs_evaluated,
            triggered = report.triggered,
            acted = report.acted,
            deduplicated = report.deduplicated,
            failures = report.action_failures,
            "Rule pass finished"
        );
        Ok(report)
    }

    /// Action log entries for the user, newest first, capped at the
    /// configured query limit.
    pub async fn get_logs(&self, user_id: &str, filter: LogFilter) -> EngineResult<Vec<ActionLogEntry>> {
        let cap = self.config.log_query_limit;
        let filter = LogFilter {
            limit: Some(filter.limit.map_or(cap, |l| l.min(cap))),
            ..filter
        };
        self.log.query(user_id, &filter).await
    }

    /// Undo a stop action. Serialized with other actions on the same ad.
    pub async fn revert(&self, entry_id: Uuid, user_id: &str) -> EngineResult<ActionLogEntry> {
        let entry = self
            .log
            .get(entry_id)
            .await?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("action log entry {entry_id}")))?;

        let lock = self.ad_lock(&entry.ad_id);
        let _guard = lock.lock().await;
        let result = self.executor.revert(entry_id, user_id).await;

        let label = match &result {
            Ok(_) => "reverted",
            Err(EngineError::ActionExecutionFailed(_)) => "resume_failed",
            Err(_) => "rejected",
        };
        metrics::counter!("engine.reverts", "result" => label).increment(1);
        result
    }

    /// `revert` flattened into a success flag and an optional message.
    pub async fn revert_action(&self, entry_id: Uuid, user_id: &str) -> RevertOutcome {
        match self.revert(entry_id, user_id).await {
            Ok(_) => RevertOutcome {
                success: true,
                entry_id,
                error: None,
            },
            Err(err) => RevertOutcome {
                success: false,
                entry_id,
                error: Some(err.to_string()),
            },
        }
    }

    /// Reverted stops whose resume call failed; the ad may still be paused.
    pub async fn pending_reconciliation(&self, user_id: &str) -> EngineResult<Vec<ActionLogEntry>> {
        self.log.pending_reconciliation(user_id).await
    }

    async fn evaluate_pair(&self, pass_id: Uuid, rule: &Rule, ad: AdRef) -> EngineResult<PairOutcome> {
        let mut sm = PairStateMachine::new();
        metrics::counter!("engine.evaluations").increment(1);

        let snapshot = match self.fetch_snapshot(&ad).await {
            Ok(snapshot) => snapshot,
            Err(skip) => {
                sm.transition(PairState::Skipped)?;
                return Ok(skipped(&sm, rule, &ad, false, skip.0, skip.1));
            }
        };
        sm.transition(PairState::Evaluated)?;

        let evaluation = self.evaluator.evaluate(
            rule.rule_type,
            rule.condition.operator,
            rule.condition.value,
            &snapshot.metrics,
        );
        debug!(
            %pass_id,
            rule_id = %rule.id,
            ad_id = %ad.ad_id,
            triggered = evaluation.triggered,
            reason = %evaluation.reason,
            "Condition evaluated"
        );

        if !evaluation.triggered {
            sm.transition(PairState::NotTriggered)?;
            sm.transition(PairState::Skipped)?;
            self.record_evaluation(pass_id, rule, &ad, EvaluationOutcome::NotTriggered, false)
                .await?;
            return Ok(skipped(
                &sm,
                rule,
                &ad,
                false,
                SkipReason::NotTriggered,
                evaluation.reason,
            ));
        }
        sm.transition(PairState::Triggered)?;
        metrics::counter!("engine.triggered").increment(1);

        let lock = self.ad_lock(&ad.ad_id);
        let _guard = lock.lock().await;

        let previous = self.log.last_evaluation(rule.id, &ad.ad_id).await?;
        let already_notified = previous
            .is_some_and(|p| p.outcome == EvaluationOutcome::Triggered && p.notified);

        if !rule.actions.stop_ad && already_notified {
            sm.transition(PairState::Skipped)?;
            self.record_evaluation(pass_id, rule, &ad, EvaluationOutcome::Triggered, true)
                .await?;
            return Ok(skipped(
                &sm,
                rule,
                &ad,
                true,
                SkipReason::AlreadyNotified,
                evaluation.reason,
            ));
        }

        let delivering = if rule.actions.stop_ad {
            // the ad's live status is authoritative; re-read it under the lock
            match self.fetch_snapshot(&ad).await {
                Ok(live) => live.status.is_delivering(),
                Err((reason, detail)) => {
                    sm.transition(PairState::Skipped)?;
                    return Ok(skipped(&sm, rule, &ad, true, reason, detail));
                }
            }
        } else {
            snapshot.status.is_delivering()
        };

        if !delivering {
            let reason = if self.log.live_stop_for(&ad.ad_id).await?.is_some() {
                SkipReason::AlreadyStopped
            } else {
                SkipReason::NotDelivering
            };
            sm.transition(PairState::Skipped)?;
            self.record_evaluation(
                pass_id,
                rule,
                &ad,
                EvaluationOutcome::Triggered,
                already_notified,
            )
            .await?;
            return Ok(skipped(&sm, rule, &ad, true, reason, evaluation.reason));
        }

        let target = ActionTarget {
            ad: ad.clone(),
            ad_name: snapshot.ad_name.clone(),
        };
        let entry = self
            .executor
            .execute(rule, &target, &evaluation.reason, &snapshot.metrics, Some(pass_id))
            .await?;
        sm.transition(PairState::Acted)?;
        self.record_evaluation(
            pass_id,
            rule,
            &ad,
            EvaluationOutcome::Triggered,
            rule.actions.notify,
        )
        .await?;

        Ok(PairOutcome {
            rule_id: rule.id,
            ad_id: ad.ad_id,
            state: sm.state(),
            triggered: true,
            skip_reason: None,
            entry_id: Some(entry.id),
            action_status: Some(entry.status),
            reason: Some(entry.reason),
        })
    }

    /// Fetches the ad's snapshot with a timeout. Failures come back as the
    /// skip reason and a description.
    async fn fetch_snapshot(&self, ad: &AdRef) -> Result<AdSnapshot, (SkipReason, String)> {
        let failure = match timeout(self.metrics_timeout(), self.metrics.get_metrics(ad)).await {
            Ok(Ok(Some(snapshot))) => return Ok(snapshot),
            Ok(Ok(None)) => EngineError::MetricsUnavailable {
                ad_id: ad.ad_id.clone(),
                reason: "no statistics reported".into(),
            },
            Ok(Err(PlatformError::NotFound(what))) => EngineError::StaleTarget(what),
            Ok(Err(err)) => EngineError::MetricsUnavailable {
                ad_id: ad.ad_id.clone(),
                reason: err.to_string(),
            },
            Err(_) => EngineError::Timeout {
                operation: "get_metrics".into(),
                timeout_ms: self.config.metrics_timeout_ms,
            },
        };

        let reason = match failure {
            EngineError::StaleTarget(_) => SkipReason::StaleTarget,
            _ => {
                metrics::counter!("engine.metrics_unavailable").increment(1);
                SkipReason::MetricsUnavailable
            }
        };
        warn!(ad_id = %ad.ad_id, error = %failure, "Skipping ad this pass");
        Err((reason, failure.to_string()))
    }

    async fn record_evaluation(
        &self,
        pass_id: Uuid,
        rule: &Rule,
        ad: &AdRef,
        outcome: EvaluationOutcome,
        notified: bool,
    ) -> EngineResult<()> {
        self.log
            .record_evaluation(EvaluationRecord {
                pass_id,
                rule_id: rule.id,
                ad_id: ad.ad_id.clone(),
                evaluated_at: self.clock.now_ms(),
                outcome,
                notified,
            })
            .await
    }

    fn ad_lock(&self, ad_id: &str) -> Arc<Mutex<()>> {
        self.ad_locks
            .entry(ad_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops locks for ads no task or revert currently holds.
    fn prune_ad_locks(&self) {
        self.ad_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.config.metrics_timeout_ms)
    }

    fn inventory_timeout(&self) -> Duration {
        Duration::from_millis(self.config.inventory_timeout_ms)
    }
}

fn skipped(
    sm: &PairStateMachine,
    rule: &Rule,
    ad: &AdRef,
    triggered: bool,
    skip_reason: SkipReason,
    reason: String,
) -> PairOutcome {
    PairOutcome {
        rule_id: rule.id,
        ad_id: ad.ad_id.clone(),
        state: sm.state(),
        triggered,
        skip_reason: Some(skip_reason),
        entry_id: None,
        action_status: None,
        reason: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrules_core::clock::ManualClock;
    use adrules_core::config::TierConfig;
    use adrules_core::types::{
        AdMetrics, AdStatus, ConditionOperator, RuleActions, RuleCondition, RuleDraft,
        RuleTargets, RuleType, Tier,
    };

    use crate::action_log::InMemoryActionLog;
    use crate::collaborators::{CaptureNotifier, StaticTierLimits};
    use crate::simulation::{SimOp, SimulatedPlatform};

    struct Harness {
        platform: Arc<SimulatedPlatform>,
        notifier: Arc<CaptureNotifier>,
        log: Arc<InMemoryActionLog>,
        engine: RuleEngine,
    }

    fn harness() -> Harness {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.add_account("u1", "A", "Account A");
        platform.add_campaign("A", "C1", "Campaign");
        platform
            .add_ad(
                "C1",
                "ad-1",
                "Expensive",
                AdMetrics {
                    spend: 6000.0,
                    leads: 10,
                    clicks: 5,
                    impressions: 1000,
                    daily_spend: 6000.0,
                    active_hours: 10.0,
                },
            )
            .unwrap();

        let tiers = StaticTierLimits::new(TierConfig::default());
        tiers.assign("u1", Tier::Pro);
        let rules = Arc::new(RuleRegistry::new(Arc::new(tiers)));
        let notifier = Arc::new(CaptureNotifier::new());
        let log = Arc::new(InMemoryActionLog::new());
        let engine = RuleEngine::new(
            EngineConfig {
                metrics_timeout_ms: 100,
                ..Default::default()
            },
            rules,
            Collaborators {
                inventory: platform.clone(),
                metrics: platform.clone(),
                controller: platform.clone(),
                notifier: notifier.clone(),
                log: log.clone(),
                clock: Arc::new(ManualClock::new(1_000)),
            },
        );
        Harness {
            platform,
            notifier,
            log,
            engine,
        }
    }

    fn add_rule(h: &Harness, stop_ad: bool, notify: bool) -> Rule {
        h.engine
            .rules()
            .create_rule(
                "u1",
                RuleDraft {
                    name: "CPL guard".into(),
                    rule_type: RuleType::CplLimit,
                    condition: RuleCondition {
                        operator: ConditionOperator::GreaterThan,
                        value: 500.0,
                    },
                    actions: RuleActions { stop_ad, notify },
                    targets: RuleTargets {
                        account_ids: ["A".to_string()].into_iter().collect(),
                        ..Default::default()
                    },
                    is_active: true,
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_pass_stops_breaching_ad_once() {
        let h = harness();
        add_rule(&h, true, true);

        let first = h.engine.run_pass().await.unwrap();
        assert_eq!(first.acted, 1);
        assert_eq!(first.outcomes[0].state, PairState::Acted);

        let second = h.engine.run_pass().await.unwrap();
        assert_eq!(second.acted, 0);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(
            second.outcomes[0].skip_reason,
            Some(SkipReason::AlreadyStopped)
        );
        assert_eq!(h.platform.stop_calls(), 1);
        assert_eq!(h.log.len(), 1);
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_ad_locks_released_after_pass() {
        let h = harness();
        let rule = add_rule(&h, true, false);

        h.engine.run_pass().await.unwrap();
        assert!(h.engine.ad_locks.is_empty());

        let entry = h
            .engine
            .get_logs("u1", LogFilter::default())
            .await
            .unwrap()
            .remove(0);
        assert_eq!(entry.rule_id, rule.id);
        h.engine.revert(entry.id, "u1").await.unwrap();
        assert_eq!(h.engine.ad_locks.len(), 1);

        h.engine.run_pass().await.unwrap();
        assert!(h.engine.ad_locks.is_empty());
    }

    #[tokio::test]
    async fn test_notify_only_notifies_once_per_episode() {
        let h = harness();
        add_rule(&h, false, true);

        h.engine.run_pass().await.unwrap();
        let again = h.engine.run_pass().await.unwrap();
        assert_eq!(again.outcomes[0].skip_reason, Some(SkipReason::AlreadyNotified));
        assert_eq!(h.notifier.count(), 1);

        // condition clears, then breaches again
        h.platform.set_metrics(
            "ad-1",
            AdMetrics {
                spend: 100.0,
                leads: 10,
                ..Default::default()
            },
        );
        let cleared = h.engine.run_pass().await.unwrap();
        assert_eq!(cleared.outcomes[0].skip_reason, Some(SkipReason::NotTriggered));
        h.platform.set_metrics(
            "ad-1",
            AdMetrics {
                spend: 9000.0,
                leads: 10,
                ..Default::default()
            },
        );
        let rearmed = h.engine.run_pass().await.unwrap();
        assert_eq!(rearmed.acted, 1);
        assert_eq!(h.notifier.count(), 2);
        assert_eq!(h.platform.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_externally_paused_ad_is_not_acted_on() {
        let h = harness();
        add_rule(&h, true, false);
        h.platform.set_status("ad-1", AdStatus::Paused);
        let report = h.engine.run_pass().await.unwrap();
        assert_eq!(report.not_delivering, 1);
        assert_eq!(report.acted, 0);
        assert!(h.log.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_timeout_skips_without_log() {
        let h = harness();
        add_rule(&h, true, false);
        h.platform.set_latency(SimOp::Metrics, Duration::from_millis(400));
        let report = h.engine.run_pass().await.unwrap();
        assert_eq!(report.metrics_unavailable, 1);
        assert_eq!(
            report.outcomes[0].skip_reason,
            Some(SkipReason::MetricsUnavailable)
        );
        assert!(h.log.is_empty());
        assert_eq!(h.platform.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_inventory_failure_skips_user_rules() {
        let h = harness();
        add_rule(&h, true, false);
        h.platform
            .fail_next(SimOp::Inventory, "u1", PlatformError::Unauthorized);
        let report = h.engine.run_pass().await.unwrap();
        assert_eq!(report.rules_considered, 1);
        assert_eq!(report.rules_skipped, 1);
        assert_eq!(report.pairs_evaluated, 0);
    }

    #[tokio::test]
    async fn test_get_logs_caps_limit() {
        let h = harness();
        h.platform
            .add_ad(
                "C1",
                "ad-2",
                "Also expensive",
                AdMetrics {
                    spend: 8000.0,
                    leads: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        add_rule(&h, true, false);
        h.engine.run_pass().await.unwrap();

        let all = h.engine.get_logs("u1", LogFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let one = h
            .engine
            .get_logs(
                "u1",
                LogFilter {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert!(h.engine.get_logs("u2", LogFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revert_action_outcome() {
        let h = harness();
        add_rule(&h, true, false);
        let report = h.engine.run_pass().await.unwrap();
        let entry_id = report.outcomes[0].entry_id.unwrap();

        let outcome = h.engine.revert_action(entry_id, "u1").await;
        assert!(outcome.success);
        let outcome = h.engine.revert_action(entry_id, "u1").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("already reverted"));
    }
}
