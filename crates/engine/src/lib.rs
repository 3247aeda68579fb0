//! Rule evaluation and action engine.
//!
//! A pass walks every active rule, expands its targets against the user's ad
//! inventory, evaluates the rule condition on each ad's current metrics and,
//! when it triggers, stops and/or notifies through the platform
//! collaborators. Every action attempt lands in the action log, and stop
//! actions can be reverted for a short window afterwards.

pub mod action_log;
pub mod collaborators;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod resolver;
pub mod retry;
pub mod rules;
pub mod savings;
pub mod simulation;
pub mod state_machine;

pub use action_log::{ActionLogStore, InMemoryActionLog};
pub use collaborators::{
    AdController, CaptureNotifier, InventorySource, LogNotifier, MetricsProvider,
    NotificationRequest, Notifier, StaticTierLimits, TierLimits,
};
pub use engine::{Collaborators, PairOutcome, PassReport, RuleEngine, SkipReason};
pub use evaluator::{ConditionEvaluator, Evaluation};
pub use executor::{ActionExecutor, ActionTarget};
pub use resolver::{Resolution, TargetResolver};
pub use retry::{RateLimitRetry, RetryPolicy};
pub use rules::RuleRegistry;
pub use savings::{LookaheadSavings, SavingsPolicy};
pub use simulation::{AdPace, SimOp, SimulatedPlatform};
pub use state_machine::{PairState, PairStateMachine};
