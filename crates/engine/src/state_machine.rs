use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use adrules_core::error::{EngineError, EngineResult};

/// Lifecycle of one (rule, ad) pair within a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Pending,
    Evaluated,
    Triggered,
    NotTriggered,
    Acted,
    Skipped,
}

impl PairState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairState::Acted | PairState::Skipped)
    }
}

/// A single allowed move, named after what causes it.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition {
    pub from: PairState,
    pub to: PairState,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StateTransition] = &[
    StateTransition {
        from: PairState::Pending,
        to: PairState::Evaluated,
        trigger: "metrics_fetched",
    },
    StateTransition {
        from: PairState::Pending,
        to: PairState::Skipped,
        trigger: "metrics_unavailable",
    },
    StateTransition {
        from: PairState::Evaluated,
        to: PairState::Triggered,
        trigger: "condition_met",
    },
    StateTransition {
        from: PairState::Evaluated,
        to: PairState::NotTriggered,
        trigger: "condition_not_met",
    },
    StateTransition {
        from: PairState::Triggered,
        to: PairState::Acted,
        trigger: "action_logged",
    },
    StateTransition {
        from: PairState::Triggered,
        to: PairState::Skipped,
        trigger: "deduplicated",
    },
    StateTransition {
        from: PairState::NotTriggered,
        to: PairState::Skipped,
        trigger: "nothing_to_do",
    },
];

/// Guards the per-pair lifecycle so the orchestrator cannot, for example,
/// act on a pair that was never evaluated.
#[derive(Debug, Clone)]
pub struct PairStateMachine {
    state: PairState,
    history: Vec<&'static str>,
}

impl PairStateMachine {
    pub fn new() -> Self {
        Self {
            state: PairState::Pending,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Triggers of the transitions taken so far, in order.
    pub fn history(&self) -> &[&'static str] {
        &self.history
    }

    pub fn can_transition(&self, to: PairState) -> bool {
        TRANSITIONS
            .iter()
            .any(|t| t.from == self.state && t.to == to)
    }

    pub fn transition(&mut self, to: PairState) -> EngineResult<()> {
        let step = TRANSITIONS
            .iter()
            .find(|t| t.from == self.state && t.to == to)
            .ok_or_else(|| {
                EngineError::Internal(anyhow::anyhow!(
                    "Invalid pair state transition from {:?} to {:?}",
                    self.state,
                    to
                ))
            })?;
        self.history.push(step.trigger);
        self.state = to;
        Ok(())
    }
}

impl Default for PairStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggered_path_to_acted() {
        let mut sm = PairStateMachine::new();
        sm.transition(PairState::Evaluated).unwrap();
        sm.transition(PairState::Triggered).unwrap();
        sm.transition(PairState::Acted).unwrap();
        assert!(sm.state().is_terminal());
        assert_eq!(
            sm.history(),
            &["metrics_fetched", "condition_met", "action_logged"]
        );
    }

    #[test]
    fn test_not_triggered_path_to_skipped() {
        let mut sm = PairStateMachine::new();
        sm.transition(PairState::Evaluated).unwrap();
        sm.transition(PairState::NotTriggered).unwrap();
        assert!(!sm.can_transition(PairState::Acted));
        sm.transition(PairState::Skipped).unwrap();
        assert_eq!(sm.state(), PairState::Skipped);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = PairStateMachine::new();
        assert!(sm.transition(PairState::Acted).is_err());
        assert!(sm.transition(PairState::Triggered).is_err());
        assert_eq!(sm.state(), PairState::Pending);

        sm.transition(PairState::Skipped).unwrap();
        assert!(sm.transition(PairState::Evaluated).is_err());
    }
}
