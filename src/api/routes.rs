//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::{ApiError, Envelope};
use crate::executor::record::{ExecutionId, ExecutionRecord, TriggerContext};
use crate::probes::ProbeOutcome;
use crate::rules::{AutomationRule, RuleDraft, RuleId};
use crate::sites::{MonitoredSite, SiteDraft, SiteId};
use crate::storage::{ExecutionLedger, ProbeLedger, RuleStore, SiteRegistry};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sites", get(list_sites).post(create_site))
        .route("/sites/{id}", get(get_site).put(update_site).delete(delete_site))
        .route("/sites/{id}/outcomes", get(site_outcomes))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/rules/{id}/execute", post(execute_rule))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    classifier_degraded: bool,
    executions_in_flight: usize,
}

async fn health(State(state): State<AppState>) -> ApiResult<Health> {
    Ok(Envelope::of(Health {
        status: "ok",
        classifier_degraded: state.classifier.is_degraded(),
        executions_in_flight: state.executor.in_flight(),
    }))
}

/// Latest outcome of every site.
async fn status(State(state): State<AppState>) -> ApiResult<Vec<ProbeOutcome>> {
    Ok(Envelope::list(state.store.latest_per_site().await?))
}

// ---------------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SiteQuery {
    #[serde(default)]
    active: bool,
}

async fn list_sites(State(state): State<AppState>, Query(q): Query<SiteQuery>) -> ApiResult<Vec<MonitoredSite>> {
    let sites = if q.active {
        state.store.list_active_sites().await?
    } else {
        state.store.list_sites().await?
    };
    Ok(Envelope::list(sites))
}

async fn create_site(
    State(state): State<AppState>,
    Json(draft): Json<SiteDraft>,
) -> Result<(StatusCode, Json<Envelope<MonitoredSite>>), ApiError> {
    draft.validate().map_err(ApiError::BadRequest)?;
    let site = state.store.add_site(draft).await?;
    tracing::info!(site_id = site.id, url = %site.url, "Site registered");
    Ok((StatusCode::CREATED, Envelope::of(site)))
}

async fn get_site(State(state): State<AppState>, Path(id): Path<SiteId>) -> ApiResult<MonitoredSite> {
    Ok(Envelope::of(state.store.get_site(id).await?))
}

async fn update_site(
    State(state): State<AppState>,
    Path(id): Path<SiteId>,
    Json(draft): Json<SiteDraft>,
) -> ApiResult<MonitoredSite> {
    draft.validate().map_err(ApiError::BadRequest)?;
    Ok(Envelope::of(state.store.update_site(id, draft).await?))
}

async fn delete_site(State(state): State<AppState>, Path(id): Path<SiteId>) -> Result<StatusCode, ApiError> {
    state.store.remove_site(id).await?;
    tracing::info!(site_id = id, "Site removed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// Newest first.
async fn site_outcomes(
    State(state): State<AppState>,
    Path(id): Path<SiteId>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<ProbeOutcome>> {
    state.store.get_site(id).await?;
    let outcomes = state.store.recent_for_site(id, clamp_limit(q.limit)).await?;
    Ok(Envelope::list(outcomes))
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

async fn list_rules(State(state): State<AppState>) -> ApiResult<Vec<AutomationRule>> {
    Ok(Envelope::list(state.store.list_rules().await?))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<Envelope<AutomationRule>>), ApiError> {
    draft.validate()?;
    let rule = state.store.create_rule(draft).await?;
    tracing::info!(rule_id = rule.id, name = %rule.name, "Rule created");
    Ok((StatusCode::CREATED, Envelope::of(rule)))
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<RuleId>) -> ApiResult<AutomationRule> {
    Ok(Envelope::of(state.store.get_rule(id).await?))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<RuleId>,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<AutomationRule> {
    draft.validate()?;
    Ok(Envelope::of(state.store.update_rule(id, draft).await?))
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<StatusCode, ApiError> {
    state.store.delete_rule(id).await?;
    tracing::info!(rule_id = id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    site_id: Option<SiteId>,
}

/// Manual trigger. Waits for the script and returns the finalized record.
async fn execute_rule(
    State(state): State<AppState>,
    Path(id): Path<RuleId>,
    body: Option<Json<ExecuteRequest>>,
) -> ApiResult<ExecutionRecord> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let rule = state.store.get_rule(id).await?;
    if let Some(site_id) = req.site_id {
        state.store.get_site(site_id).await?;
    }

    let record = state
        .executor
        .execute(&rule, TriggerContext::manual(req.site_id, req.arguments))
        .await?;
    Ok(Envelope::of(record))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecutionQuery {
    limit: Option<usize>,
    site_id: Option<SiteId>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(q): Query<ExecutionQuery>,
) -> ApiResult<Vec<ExecutionRecord>> {
    let records = state
        .store
        .recent_executions(clamp_limit(q.limit), q.site_id)
        .await?;
    Ok(Envelope::list(records))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<ExecutionId>) -> ApiResult<ExecutionRecord> {
    Ok(Envelope::of(state.store.get_execution(id).await?))
}
