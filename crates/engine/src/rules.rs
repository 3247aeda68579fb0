//! User rule definitions, validated on the way in and gated by the user's
//! subscription tier.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use adrules_core::error::{EngineError, EngineResult};
use adrules_core::types::{AccountId, PlanLimits, Rule, RuleDraft};

use crate::collaborators::TierLimits;

const MAX_NAME_LEN: usize = 200;

/// Thread-safe rule store. Creation and activation hold an admission lock so
/// concurrent requests cannot push a user past their tier limits.
pub struct RuleRegistry {
    rules: DashMap<Uuid, Rule>,
    tiers: Arc<dyn TierLimits>,
    admission: parking_lot::Mutex<()>,
}

impl RuleRegistry {
    pub fn new(tiers: Arc<dyn TierLimits>) -> Self {
        Self {
            rules: DashMap::new(),
            tiers,
            admission: parking_lot::Mutex::new(()),
        }
    }

    pub fn create_rule(&self, user_id: &str, draft: RuleDraft) -> EngineResult<Rule> {
        validate(&draft)?;
        let _admission = self.admission.lock();
        let limits = self.tiers.limits(user_id);

        let owned = self.rules.iter().filter(|r| r.user_id == user_id).count();
        if owned >= limits.max_rules {
            return Err(EngineError::TierLimit(format!(
                "plan allows at most {} rules",
                limits.max_rules
            )));
        }
        if draft.is_active {
            self.check_activation(user_id, None, &draft, &limits)?;
        }

        let now = Utc::now();
        let rule = Rule {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: draft.name.trim().to_string(),
            rule_type: draft.rule_type,
            condition: draft.condition,
            actions: draft.actions,
            targets: draft.targets,
            is_active: draft.is_active,
            created_at: now,
            updated_at: now,
        };
        info!(
            rule_id = %rule.id,
            user_id,
            rule_type = %rule.rule_type,
            "Rule created"
        );
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    /// Replaces the definition of an existing rule, keeping its id and owner.
    pub fn update_rule(&self, user_id: &str, id: Uuid, draft: RuleDraft) -> EngineResult<Rule> {
        validate(&draft)?;
        let _admission = self.admission.lock();
        self.owned(user_id, id)?;
        if draft.is_active {
            let limits = self.tiers.limits(user_id);
            self.check_activation(user_id, Some(id), &draft, &limits)?;
        }

        let mut entry = self
            .rules
            .get_mut(&id)
            .ok_or_else(|| rule_not_found(id))?;
        let rule = entry.value_mut();
        rule.name = draft.name.trim().to_string();
        rule.rule_type = draft.rule_type;
        rule.condition = draft.condition;
        rule.actions = draft.actions;
        rule.targets = draft.targets;
        rule.is_active = draft.is_active;
        rule.updated_at = Utc::now();
        info!(rule_id = %id, user_id, "Rule updated");
        Ok(rule.clone())
    }

    /// Activates or deactivates a rule. Deactivation is never gated.
    pub fn set_active(&self, user_id: &str, id: Uuid, active: bool) -> EngineResult<Rule> {
        let _admission = self.admission.lock();
        let current = self.owned(user_id, id)?;
        if active && !current.is_active {
            let limits = self.tiers.limits(user_id);
            let draft = RuleDraft {
                name: current.name.clone(),
                rule_type: current.rule_type,
                condition: current.condition,
                actions: current.actions,
                targets: current.targets.clone(),
                is_active: true,
            };
            self.check_activation(user_id, Some(id), &draft, &limits)?;
        }

        let mut entry = self
            .rules
            .get_mut(&id)
            .ok_or_else(|| rule_not_found(id))?;
        entry.is_active = active;
        entry.updated_at = Utc::now();
        info!(rule_id = %id, user_id, active, "Rule toggled");
        Ok(entry.clone())
    }

    /// Flips the active flag.
    pub fn toggle_rule(&self, user_id: &str, id: Uuid) -> EngineResult<Rule> {
        let current = self.owned(user_id, id)?;
        self.set_active(user_id, id, !current.is_active)
    }

    pub fn delete_rule(&self, user_id: &str, id: Uuid) -> EngineResult<Rule> {
        self.owned(user_id, id)?;
        let (_, rule) = self.rules.remove(&id).ok_or_else(|| rule_not_found(id))?;
        info!(rule_id = %id, user_id, "Rule deleted");
        Ok(rule)
    }

    pub fn get_rule(&self, user_id: &str, id: Uuid) -> EngineResult<Rule> {
        self.owned(user_id, id)
    }

    /// The user's rules, newest first.
    pub fn list_rules(&self, user_id: &str) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rules
    }

    /// Every active rule across all users.
    pub fn active_rules(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .filter(|r| r.is_active)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn owned(&self, user_id: &str, id: Uuid) -> EngineResult<Rule> {
        self.rules
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| rule_not_found(id))
    }

    /// Checks the limits that apply to an active rule: auto-stop permission
    /// and the number of distinct accounts targeted across the user's active
    /// rules.
    fn check_activation(
        &self,
        user_id: &str,
        replacing: Option<Uuid>,
        draft: &RuleDraft,
        limits: &PlanLimits,
    ) -> EngineResult<()> {
        if draft.actions.stop_ad && !limits.auto_stop_allowed {
            return Err(EngineError::TierLimit(
                "automatic ad stopping is not available on this plan".into(),
            ));
        }

        let mut accounts: BTreeSet<AccountId> = self
            .rules
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active && Some(r.id) != replacing)
            .flat_map(|r| r.targets.account_ids.iter().cloned().collect::<Vec<_>>())
            .collect();
        accounts.extend(draft.targets.account_ids.iter().cloned());
        if accounts.len() > limits.max_accounts {
            return Err(EngineError::TierLimit(format!(
                "plan allows rules on at most {} accounts",
                limits.max_accounts
            )));
        }
        Ok(())
    }
}

fn rule_not_found(id: Uuid) -> EngineError {
    EngineError::NotFound(format!("rule {id}"))
}

fn validate(draft: &RuleDraft) -> EngineResult<()> {
    let name = draft.name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("rule name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!(
            "rule name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    let threshold = draft.condition.value;
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(EngineError::Validation(
            "threshold must be a finite, non-negative number".into(),
        ));
    }
    if draft.actions.is_empty() {
        return Err(EngineError::Validation(
            "select at least one action (stop ad or notify)".into(),
        ));
    }
    if draft.targets.is_empty() {
        return Err(EngineError::Validation(
            "select at least one account, campaign or ad".into(),
        ));
    }
    Ok(())
}
