//! OpenAPI document for the REST surface, served at `/api-docs/openapi.json`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AdRules API",
        version = "0.1.0",
        description = "Threshold rules over VK Ads performance metrics.\n\nRules stop or flag ads when a metric crosses a threshold; every action is recorded in the action log and stop actions can be reverted for five minutes.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Action log", description = "Audit trail of rule actions and revert"),
        (name = "Rules", description = "Rule definitions, gated by subscription tier"),
        (name = "Passes", description = "On-demand evaluation passes"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Action log
        crate::rest::list_logs,
        crate::rest::revert_log,
        crate::rest::pending_reconciliation,
        // Passes
        crate::rest::run_pass,
        // Rules
        crate::rest::list_rules,
        crate::rest::create_rule,
        crate::rest::update_rule,
        crate::rest::toggle_rule,
        crate::rest::delete_rule,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Rules
        adrules_core::types::Rule,
        adrules_core::types::RuleDraft,
        adrules_core::types::RuleType,
        adrules_core::types::RuleCondition,
        adrules_core::types::ConditionOperator,
        adrules_core::types::RuleActions,
        adrules_core::types::RuleTargets,
        // Action log
        adrules_core::types::ActionLogEntry,
        adrules_core::types::ActionType,
        adrules_core::types::ActionStatus,
        adrules_core::types::MetricsSnapshot,
        adrules_core::types::RevertOutcome,
        // Passes
        adrules_engine::PassReport,
        adrules_engine::PairOutcome,
        adrules_engine::PairState,
        adrules_engine::SkipReason,
        // REST error/health types
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;
