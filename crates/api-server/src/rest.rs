//! REST handlers for the action log, rule management, passes and
//! operational probes.
//!
//! Every user-scoped endpoint identifies the caller from the `x-user-id`
//! header. Ids owned by another user are reported as not found.

use adrules_core::error::EngineError;
use adrules_core::types::{
    ActionLogEntry, ActionStatus, ActionType, LogFilter, RevertOutcome, Rule, RuleDraft,
};
use adrules_engine::{PassReport, RuleEngine};
use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Header carrying the authenticated user id, set by the fronting gateway.
pub const USER_HEADER: &str = "x-user-id";

/// Header carrying the operator token for cross-user endpoints.
pub const OPERATOR_HEADER: &str = "x-operator-token";

/// Longest accepted user id.
const MAX_USER_ID_LEN: usize = 128;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: RuleEngine,
    pub node_id: String,
    pub start_time: Instant,
    pub operator_token: Option<String>,
}

/// Caller identity extracted from [`USER_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match user {
            Some(user) if user.len() <= MAX_USER_ID_LEN => Ok(CurrentUser(user.to_string())),
            Some(_) => Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_user",
                "user id exceeds maximum length",
            )),
            None => Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing_user",
                "x-user-id header is required",
            )),
        }
    }
}

/// Proof that the caller presented the configured operator token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator;

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.operator_token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "operator_disabled",
                "operator endpoints are disabled on this node",
            ));
        };
        match parts.headers.get(OPERATOR_HEADER).and_then(|v| v.to_str().ok()) {
            Some(token) if token == expected => Ok(Operator),
            Some(_) => Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "invalid_operator_token",
                "operator token rejected",
            )),
            None => Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing_operator_token",
                "x-operator-token header is required",
            )),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Error returned by every handler; carries the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match &err {
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::AlreadyReverted(_) => (StatusCode::CONFLICT, "already_reverted"),
            EngineError::NotRevertible(_) => (StatusCode::UNPROCESSABLE_ENTITY, "not_revertible"),
            EngineError::ActionExecutionFailed(_) => (StatusCode::BAD_GATEWAY, "action_failed"),
            EngineError::Validation(_) | EngineError::RuleMisconfigured(_) => {
                (StatusCode::BAD_REQUEST, "validation_failed")
            }
            EngineError::TierLimit(_) => (StatusCode::FORBIDDEN, "tier_limit"),
            EngineError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            EngineError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        metrics::counter!("api.errors", "code" => code).increment(1);
        if status.is_server_error() {
            error!(error = %err, code, "Request failed");
        } else {
            warn!(error = %err, code, "Request rejected");
        }

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal processing error".to_string()
        } else {
            err.to_string()
        };
        ApiError::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ─── Action log ─────────────────────────────────────────────────────────────

/// Query string accepted by `GET /v1/logs`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogQuery {
    pub action_type: Option<ActionType>,
    pub account_id: Option<String>,
    pub rule_id: Option<Uuid>,
    pub status: Option<ActionStatus>,
    /// Case-insensitive match over ad name and reason.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl From<LogQuery> for LogFilter {
    fn from(q: LogQuery) -> Self {
        LogFilter {
            action_type: q.action_type,
            account_id: q.account_id.filter(|a| !a.is_empty()),
            rule_id: q.rule_id,
            status: q.status,
            search_text: q.search.filter(|s| !s.trim().is_empty()),
            limit: q.limit,
        }
    }
}

/// GET /v1/logs — Action log for the caller, newest first.
#[utoipa::path(
    get,
    path = "/v1/logs",
    tag = "Action log",
    params(LogQuery, ("x-user-id" = String, Header, description = "Caller user id")),
    responses(
        (status = 200, description = "Matching entries, newest first", body = Vec<ActionLogEntry>),
        (status = 401, description = "Missing user header", body = ErrorResponse),
        (status = 503, description = "Action log unavailable", body = ErrorResponse),
    )
)]
pub async fn list_logs(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<ActionLogEntry>>, ApiError> {
    let entries = state.engine.get_logs(&user_id, query.into()).await?;
    Ok(Json(entries))
}

/// POST /v1/logs/{id}/revert — Undo a stop action and resume the ad.
#[utoipa::path(
    post,
    path = "/v1/logs/{id}/revert",
    tag = "Action log",
    params(
        ("id" = Uuid, Path, description = "Action log entry id"),
        ("x-user-id" = String, Header, description = "Caller user id"),
    ),
    responses(
        (status = 200, description = "Stop reverted, ad resumed", body = RevertOutcome),
        (status = 404, description = "Unknown entry", body = ErrorResponse),
        (status = 409, description = "Entry already reverted", body = ErrorResponse),
        (status = 422, description = "Entry is not a revertible stop", body = ErrorResponse),
        (status = 502, description = "Revert recorded but resuming the ad failed", body = ErrorResponse),
    )
)]
pub async fn revert_log(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<RevertOutcome>, ApiError> {
    let entry = state.engine.revert(entry_id, &user_id).await?;
    info!(entry_id = %entry.id, ad_id = %entry.ad_id, "Stop reverted via API");
    Ok(Json(RevertOutcome {
        success: true,
        entry_id: entry.id,
        error: None,
    }))
}

/// GET /v1/logs/reconciliation — Reverted stops whose resume failed.
#[utoipa::path(
    get,
    path = "/v1/logs/reconciliation",
    tag = "Action log",
    params(("x-user-id" = String, Header, description = "Caller user id")),
    responses(
        (status = 200, description = "Entries awaiting manual resume", body = Vec<ActionLogEntry>),
    )
)]
pub async fn pending_reconciliation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<ActionLogEntry>>, ApiError> {
    Ok(Json(state.engine.pending_reconciliation(&user_id).await?))
}

// ─── Passes ─────────────────────────────────────────────────────────────────

/// POST /v1/passes — Run one evaluation pass over every user immediately.
#[utoipa::path(
    post,
    path = "/v1/passes",
    tag = "Passes",
    params(("x-operator-token" = String, Header, description = "Operator token")),
    responses(
        (status = 200, description = "Pass completed", body = PassReport),
        (status = 401, description = "Missing operator token", body = ErrorResponse),
        (status = 403, description = "Operator token rejected or not configured", body = ErrorResponse),
        (status = 503, description = "Pass aborted, action log unavailable", body = ErrorResponse),
    )
)]
pub async fn run_pass(
    State(state): State<AppState>,
    _operator: Operator,
) -> Result<Json<PassReport>, ApiError> {
    let report = state.engine.run_pass().await?;
    Ok(Json(report))
}

// ─── Rules ──────────────────────────────────────────────────────────────────

/// GET /v1/rules — Rules owned by the caller.
#[utoipa::path(
    get,
    path = "/v1/rules",
    tag = "Rules",
    params(("x-user-id" = String, Header, description = "Caller user id")),
    responses((status = 200, description = "Rules, newest first", body = Vec<Rule>))
)]
pub async fn list_rules(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Json<Vec<Rule>> {
    Json(state.engine.rules().list_rules(&user_id))
}

/// POST /v1/rules — Create a rule.
#[utoipa::path(
    post,
    path = "/v1/rules",
    tag = "Rules",
    request_body = RuleDraft,
    params(("x-user-id" = String, Header, description = "Caller user id")),
    responses(
        (status = 201, description = "Rule created", body = Rule),
        (status = 400, description = "Invalid rule", body = ErrorResponse),
        (status = 403, description = "Plan limit reached", body = ErrorResponse),
    )
)]
pub async fn create_rule(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    let rule = state.engine.rules().create_rule(&user_id, draft)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// PUT /v1/rules/{id} — Replace a rule definition.
#[utoipa::path(
    put,
    path = "/v1/rules/{id}",
    tag = "Rules",
    request_body = RuleDraft,
    params(
        ("id" = Uuid, Path, description = "Rule id"),
        ("x-user-id" = String, Header, description = "Caller user id"),
    ),
    responses(
        (status = 200, description = "Rule updated", body = Rule),
        (status = 400, description = "Invalid rule", body = ErrorResponse),
        (status = 403, description = "Plan limit reached", body = ErrorResponse),
        (status = 404, description = "Unknown rule", body = ErrorResponse),
    )
)]
pub async fn update_rule(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(rule_id): Path<Uuid>,
    Json(draft): Json<RuleDraft>,
) -> Result<Json<Rule>, ApiError> {
    Ok(Json(state.engine.rules().update_rule(&user_id, rule_id, draft)?))
}

/// POST /v1/rules/{id}/toggle — Flip a rule between active and inactive.
#[utoipa::path(
    post,
    path = "/v1/rules/{id}/toggle",
    tag = "Rules",
    params(
        ("id" = Uuid, Path, description = "Rule id"),
        ("x-user-id" = String, Header, description = "Caller user id"),
    ),
    responses(
        (status = 200, description = "Rule toggled", body = Rule),
        (status = 403, description = "Plan does not allow activating this rule", body = ErrorResponse),
        (status = 404, description = "Unknown rule", body = ErrorResponse),
    )
)]
pub async fn toggle_rule(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(rule_id): Path<Uuid>,
) -> Result<Json<Rule>, ApiError> {
    Ok(Json(state.engine.rules().toggle_rule(&user_id, rule_id)?))
}

/// DELETE /v1/rules/{id} — Delete a rule. Its log entries are kept.
#[utoipa::path(
    delete,
    path = "/v1/rules/{id}",
    tag = "Rules",
    params(
        ("id" = Uuid, Path, description = "Rule id"),
        ("x-user-id" = String, Header, description = "Caller user id"),
    ),
    responses(
        (status = 204, description = "Rule deleted"),
        (status = 404, description = "Unknown rule", body = ErrorResponse),
    )
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(rule_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.rules().delete_rule(&user_id, rule_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Operations ─────────────────────────────────────────────────────────────

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        rules: state.engine.rules().len(),
    })
}

/// GET /ready — Readiness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses((status = 200, description = "Ready to accept traffic"))
)]
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live — Liveness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub rules: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrules_core::clock::SystemClock;
    use adrules_core::config::{EngineConfig, TierConfig};
    use adrules_core::types::{
        ConditionOperator, RuleActions, RuleCondition, RuleTargets, RuleType, Tier,
    };
    use adrules_engine::{
        CaptureNotifier, Collaborators, InMemoryActionLog, RuleRegistry, SimulatedPlatform,
        StaticTierLimits,
    };
    use axum::http::Request;
    use std::sync::Arc;

    const USER: &str = "user-1";
    const OPERATOR_TOKEN: &str = "op-secret";

    fn state() -> AppState {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.seed_demo(USER);
        let tiers = Arc::new(StaticTierLimits::new(TierConfig::default()));
        tiers.assign(USER, Tier::Pro);
        let rules = Arc::new(RuleRegistry::new(tiers));
        let engine = RuleEngine::new(
            EngineConfig::default(),
            rules,
            Collaborators {
                inventory: platform.clone(),
                metrics: platform.clone(),
                controller: platform,
                notifier: Arc::new(CaptureNotifier::new()),
                log: Arc::new(InMemoryActionLog::new()),
                clock: Arc::new(SystemClock),
            },
        );
        AppState {
            engine,
            node_id: "test-node".into(),
            start_time: Instant::now(),
            operator_token: Some(OPERATOR_TOKEN.into()),
        }
    }

    async fn operator_from(state: &AppState, token: Option<&str>) -> Result<Operator, ApiError> {
        let mut request = Request::builder().method("POST").uri("/v1/passes");
        if let Some(token) = token {
            request = request.header(OPERATOR_HEADER, token);
        }
        let (mut parts, _) = request.body(()).unwrap().into_parts();
        Operator::from_request_parts(&mut parts, state).await
    }

    fn cpl_stop_draft() -> RuleDraft {
        RuleDraft {
            name: "CPL guard".into(),
            rule_type: RuleType::CplLimit,
            condition: RuleCondition {
                operator: ConditionOperator::GreaterThan,
                value: 500.0,
            },
            actions: RuleActions {
                stop_ad: true,
                notify: false,
            },
            targets: RuleTargets {
                campaign_ids: ["demo-camp-leads".to_string()].into(),
                ..Default::default()
            },
            is_active: true,
        }
    }

    fn user(id: &str) -> CurrentUser {
        CurrentUser(id.to_string())
    }

    #[tokio::test]
    async fn test_missing_user_header_is_unauthorized() {
        let (mut parts, _) = Request::builder()
            .uri("/v1/logs")
            .body(())
            .unwrap()
            .into_parts();
        let err = CurrentUser::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.body.error, "missing_user");
    }

    #[tokio::test]
    async fn test_user_header_is_trimmed() {
        let (mut parts, _) = Request::builder()
            .uri("/v1/logs")
            .header(USER_HEADER, "  user-1 ")
            .body(())
            .unwrap()
            .into_parts();
        let user = CurrentUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user, CurrentUser("user-1".into()));
    }

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        let cases = [
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::AlreadyReverted(Uuid::new_v4()), StatusCode::CONFLICT),
            (EngineError::NotRevertible("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::ActionExecutionFailed("x".into()), StatusCode::BAD_GATEWAY),
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::TierLimit("x".into()), StatusCode::FORBIDDEN),
            (EngineError::Store("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = ApiError::from(EngineError::Config("secret path /etc/x".into()));
        assert_eq!(err.body.message, "Internal processing error");
    }

    #[test]
    fn test_log_query_converts_to_filter() {
        let query: LogQuery = serde_json::from_str(
            r#"{"action_type":"stopped","status":"success","search":"  ","account_id":"acc-1","limit":5}"#,
        )
        .unwrap();
        let filter = LogFilter::from(query);
        assert_eq!(filter.action_type, Some(ActionType::Stopped));
        assert_eq!(filter.status, Some(ActionStatus::Success));
        assert_eq!(filter.account_id.as_deref(), Some("acc-1"));
        assert_eq!(filter.search_text, None);
        assert_eq!(filter.limit, Some(5));
    }

    #[tokio::test]
    async fn test_create_and_list_rules() {
        let state = state();
        let (status, Json(rule)) =
            create_rule(State(state.clone()), user(USER), Json(cpl_stop_draft()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(rule.user_id, USER);

        let Json(rules) = list_rules(State(state.clone()), user(USER)).await;
        assert_eq!(rules.len(), 1);
        let Json(other) = list_rules(State(state), user("user-2")).await;
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rule_is_bad_request() {
        let state = state();
        let mut draft = cpl_stop_draft();
        draft.name = "   ".into();
        let err = create_rule(State(state), user(USER), Json(draft))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_free_tier_cannot_create_stop_rule() {
        let state = state();
        let err = create_rule(State(state), user("free-user"), Json(cpl_stop_draft()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_toggle_and_delete_foreign_rule_not_found() {
        let state = state();
        let (_, Json(rule)) = create_rule(State(state.clone()), user(USER), Json(cpl_stop_draft()))
            .await
            .unwrap();

        let err = toggle_rule(State(state.clone()), user("user-2"), Path(rule.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(toggled) = toggle_rule(State(state.clone()), user(USER), Path(rule.id))
            .await
            .unwrap();
        assert!(!toggled.is_active);

        let status = delete_rule(State(state.clone()), user(USER), Path(rule.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = delete_rule(State(state), user(USER), Path(rule.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pass_then_revert_via_handlers() {
        let state = state();
        create_rule(State(state.clone()), user(USER), Json(cpl_stop_draft()))
            .await
            .unwrap();

        let Json(report) = run_pass(State(state.clone()), Operator).await.unwrap();
        assert_eq!(report.acted, 1);

        let Json(logs) = list_logs(
            State(state.clone()),
            user(USER),
            Query(LogQuery {
                action_type: Some(ActionType::Stopped),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ad_id, "demo-ad-expensive");

        let err = revert_log(State(state.clone()), user("user-2"), Path(logs[0].id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(outcome) = revert_log(State(state.clone()), user(USER), Path(logs[0].id))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.entry_id, logs[0].id);

        let err = revert_log(State(state), user(USER), Path(logs[0].id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_pass_endpoint_requires_operator_token() {
        let mut state = state();
        assert_eq!(operator_from(&state, Some(OPERATOR_TOKEN)).await.unwrap(), Operator);

        let err = operator_from(&state, None).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let err = operator_from(&state, Some("guess")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        state.operator_token = None;
        let err = operator_from(&state, Some(OPERATOR_TOKEN)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.body.error, "operator_disabled");
    }

    #[tokio::test]
    async fn test_health_reports_node() {
        let Json(health) = health_check(State(state())).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.node_id, "test-node");
        assert_eq!(health.rules, 0);
    }
}
