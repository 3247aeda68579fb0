//! Append-only audit store for rule actions, plus the per-(rule, ad)
//! evaluation ledger the orchestrator resumes from.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use adrules_core::error::{EngineError, EngineResult};
use adrules_core::types::{
    ActionLogEntry, ActionStatus, AdId, EvaluationRecord, LogFilter,
};

#[async_trait]
pub trait ActionLogStore: Send + Sync {
    /// Persists a new entry and returns it as stored. The store owns the final
    /// `created_at`, which is strictly greater than any earlier entry's.
    async fn append(&self, entry: ActionLogEntry) -> EngineResult<ActionLogEntry>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<ActionLogEntry>>;

    /// Entries owned by `user_id` that match `filter`, newest first.
    async fn query(&self, user_id: &str, filter: &LogFilter) -> EngineResult<Vec<ActionLogEntry>>;

    /// Compare-and-set `success -> reverted`. Fails with `AlreadyReverted` when
    /// another caller got there first.
    async fn mark_reverted(&self, id: Uuid, at_ms: i64) -> EngineResult<ActionLogEntry>;

    async fn record_resume_failure(&self, id: Uuid, error: &str) -> EngineResult<()>;

    /// The newest unreverted successful stop for the ad, if any.
    async fn live_stop_for(&self, ad_id: &str) -> EngineResult<Option<ActionLogEntry>>;

    /// Reverted entries whose resume call failed, newest first.
    async fn pending_reconciliation(&self, user_id: &str) -> EngineResult<Vec<ActionLogEntry>>;

    async fn record_evaluation(&self, record: EvaluationRecord) -> EngineResult<()>;

    async fn last_evaluation(
        &self,
        rule_id: Uuid,
        ad_id: &str,
    ) -> EngineResult<Option<EvaluationRecord>>;
}

/// DashMap-backed store. Survives for the lifetime of the process only.
#[derive(Default)]
pub struct InMemoryActionLog {
    entries: DashMap<Uuid, ActionLogEntry>,
    evaluations: DashMap<(Uuid, AdId), EvaluationRecord>,
    last_created_at: parking_lot::Mutex<i64>,
    unavailable: AtomicBool,
}

impl InMemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the backing store: every operation fails with
    /// `EngineError::Store` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Store("action log store unavailable".into()));
        }
        Ok(())
    }

    fn newest_first(mut entries: Vec<ActionLogEntry>) -> Vec<ActionLogEntry> {
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        entries
    }
}

#[async_trait]
impl ActionLogStore for InMemoryActionLog {
    async fn append(&self, mut entry: ActionLogEntry) -> EngineResult<ActionLogEntry> {
        self.ensure_available()?;
        {
            let mut last = self.last_created_at.lock();
            if entry.created_at <= *last {
                entry.created_at = *last + 1;
            }
            *last = entry.created_at;
            self.entries.insert(entry.id, entry.clone());
        }
        info!(
            entry_id = %entry.id,
            rule_id = %entry.rule_id,
            ad_id = %entry.ad_id,
            action_type = ?entry.action_type,
            status = ?entry.status,
            "Action logged"
        );
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<ActionLogEntry>> {
        self.ensure_available()?;
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }

    async fn query(&self, user_id: &str, filter: &LogFilter) -> EngineResult<Vec<ActionLogEntry>> {
        self.ensure_available()?;
        let matching: Vec<ActionLogEntry> = self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        let mut sorted = Self::newest_first(matching);
        if let Some(limit) = filter.limit {
            sorted.truncate(limit);
        }
        Ok(sorted)
    }

    async fn mark_reverted(&self, id: Uuid, at_ms: i64) -> EngineResult<ActionLogEntry> {
        self.ensure_available()?;
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("action log entry {id}")))?;
        match entry.status {
            ActionStatus::Reverted => Err(EngineError::AlreadyReverted(id)),
            ActionStatus::Failed => Err(EngineError::NotRevertible(
                "the stop action failed, nothing to undo".into(),
            )),
            ActionStatus::Success => {
                entry.status = ActionStatus::Reverted;
                entry.reverted_at = Some(at_ms);
                debug!(entry_id = %id, "Action marked reverted");
                Ok(entry.clone())
            }
        }
    }

    async fn record_resume_failure(&self, id: Uuid, error: &str) -> EngineResult<()> {
        self.ensure_available()?;
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("action log entry {id}")))?;
        entry.resume_error = Some(error.to_string());
        Ok(())
    }

    async fn live_stop_for(&self, ad_id: &str) -> EngineResult<Option<ActionLogEntry>> {
        self.ensure_available()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.ad_id == ad_id && e.is_live_stop())
            .max_by_key(|e| e.created_at)
            .map(|e| e.value().clone()))
    }

    async fn pending_reconciliation(&self, user_id: &str) -> EngineResult<Vec<ActionLogEntry>> {
        self.ensure_available()?;
        let pending = self
            .entries
            .iter()
            .filter(|e| {
                e.user_id == user_id
                    && e.status == ActionStatus::Reverted
                    && e.resume_error.is_some()
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(Self::newest_first(pending))
    }

    async fn record_evaluation(&self, record: EvaluationRecord) -> EngineResult<()> {
        self.ensure_available()?;
        self.evaluations
            .insert((record.rule_id, record.ad_id.clone()), record);
        Ok(())
    }

    async fn last_evaluation(
        &self,
        rule_id: Uuid,
        ad_id: &str,
    ) -> EngineResult<Option<EvaluationRecord>> {
        self.ensure_available()?;
        Ok(self
            .evaluations
            .get(&(rule_id, ad_id.to_string()))
            .map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrules_core::types::{ActionType, EvaluationOutcome, MetricsSnapshot};

    fn entry(user_id: &str, ad_id: &str, created_at: i64) -> ActionLogEntry {
        ActionLogEntry {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            rule_id: Uuid::new_v4(),
            rule_name: "CPL guard".into(),
            account_id: "acc-1".into(),
            campaign_id: "camp-1".into(),
            ad_id: ad_id.into(),
            ad_name: format!("Ad {ad_id}"),
            action_type: ActionType::Stopped,
            status: ActionStatus::Success,
            reason: "CPL 600 > 500".into(),
            metrics_snapshot: MetricsSnapshot::default(),
            saved_amount: 0.0,
            pass_id: None,
            created_at,
            reverted_at: None,
            resume_error: None,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_strictly_increasing_timestamps() {
        let log = InMemoryActionLog::new();
        let a = log.append(entry("u1", "ad-1", 1_000)).await.unwrap();
        let b = log.append(entry("u1", "ad-2", 1_000)).await.unwrap();
        let c = log.append(entry("u1", "ad-3", 500)).await.unwrap();
        assert_eq!(a.created_at, 1_000);
        assert_eq!(b.created_at, 1_001);
        assert_eq!(c.created_at, 1_002);
        let d = log.append(entry("u1", "ad-4", 5_000)).await.unwrap();
        assert_eq!(d.created_at, 5_000);
    }

    #[tokio::test]
    async fn test_query_is_user_scoped_and_newest_first() {
        let log = InMemoryActionLog::new();
        log.append(entry("u1", "ad-1", 1_000)).await.unwrap();
        log.append(entry("u2", "ad-2", 2_000)).await.unwrap();
        log.append(entry("u1", "ad-3", 3_000)).await.unwrap();

        let u1 = log.query("u1", &LogFilter::default()).await.unwrap();
        assert_eq!(u1.len(), 2);
        assert_eq!(u1[0].ad_id, "ad-3");
        assert_eq!(u1[1].ad_id, "ad-1");
        assert!(u1.iter().all(|e| e.user_id == "u1"));

        let limited = log
            .query(
                "u1",
                &LogFilter {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].ad_id, "ad-3");
    }

    #[tokio::test]
    async fn test_mark_reverted_is_compare_and_set() {
        let log = InMemoryActionLog::new();
        let e = log.append(entry("u1", "ad-1", 1_000)).await.unwrap();

        let reverted = log.mark_reverted(e.id, 2_000).await.unwrap();
        assert_eq!(reverted.status, ActionStatus::Reverted);
        assert_eq!(reverted.reverted_at, Some(2_000));

        let err = log.mark_reverted(e.id, 3_000).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyReverted(id) if id == e.id));
        let stored = log.get(e.id).await.unwrap().unwrap();
        assert_eq!(stored.reverted_at, Some(2_000));

        let err = log.mark_reverted(Uuid::new_v4(), 3_000).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_live_stop_tracking() {
        let log = InMemoryActionLog::new();
        let e = log.append(entry("u1", "ad-1", 1_000)).await.unwrap();
        assert_eq!(log.live_stop_for("ad-1").await.unwrap().map(|x| x.id), Some(e.id));
        assert!(log.live_stop_for("ad-2").await.unwrap().is_none());

        log.mark_reverted(e.id, 1_500).await.unwrap();
        assert!(log.live_stop_for("ad-1").await.unwrap().is_none());

        let mut notified = entry("u1", "ad-1", 2_000);
        notified.action_type = ActionType::Notified;
        log.append(notified).await.unwrap();
        assert!(log.live_stop_for("ad-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_reconciliation_lists_failed_resumes() {
        let log = InMemoryActionLog::new();
        let e = log.append(entry("u1", "ad-1", 1_000)).await.unwrap();
        log.mark_reverted(e.id, 1_100).await.unwrap();
        assert!(log.pending_reconciliation("u1").await.unwrap().is_empty());

        log.record_resume_failure(e.id, "platform 502").await.unwrap();
        let pending = log.pending_reconciliation("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].resume_error.as_deref(), Some("platform 502"));
        assert!(log.pending_reconciliation("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evaluation_ledger_keeps_latest() {
        let log = InMemoryActionLog::new();
        let rule_id = Uuid::new_v4();
        for (i, outcome) in [EvaluationOutcome::Triggered, EvaluationOutcome::NotTriggered]
            .into_iter()
            .enumerate()
        {
            log.record_evaluation(EvaluationRecord {
                pass_id: Uuid::new_v4(),
                rule_id,
                ad_id: "ad-1".into(),
                evaluated_at: i as i64,
                outcome,
                notified: false,
            })
            .await
            .unwrap();
        }
        let last = log.last_evaluation(rule_id, "ad-1").await.unwrap().unwrap();
        assert_eq!(last.outcome, EvaluationOutcome::NotTriggered);
        assert!(log.last_evaluation(rule_id, "ad-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let log = InMemoryActionLog::new();
        log.set_unavailable(true);
        let err = log.append(entry("u1", "ad-1", 1)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(log.query("u1", &LogFilter::default()).await.is_err());
        log.set_unavailable(false);
        assert!(log.append(entry("u1", "ad-1", 1)).await.is_ok());
    }
}
