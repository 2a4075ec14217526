//! HTTP handlers for ingestion, error groups, occurrences and environments.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use grouping_engine::types::{Level, Source};
use grouping_engine::{
  EngineError, Environment, EnvironmentUpdate, ErrorGroup, ErrorLog, GroupFilter, GroupStatus,
  InboundEvent, OccurrenceFilter,
};

use crate::dispatch::DeliveryRecord;
use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const USER_ID_HEADER: &str = "x-user-id";
const MAX_PAGE: usize = 200;
const MAX_OCCURRENCE_PAGE: usize = 500;
const HISTORY_LIMIT: usize = 50;

type Shared = State<Arc<AppState>>;

pub async fn health() -> &'static str {
  "ok"
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct IngestResponse {
  pub success: bool,
  pub occurrence_id: i64,
  pub group_id: i64,
  pub duplicate: bool,
}

/// Accept one error event for the environment owning the API key.
pub async fn ingest(
  State(state): Shared,
  headers: HeaderMap,
  payload: Result<Json<InboundEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
  let api_key = headers
    .get(API_KEY_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(str::trim)
    .unwrap_or_default();
  let env = state
    .engine
    .environments()
    .authenticate(api_key)?
    .ok_or(ApiError::Unauthorized)?;

  let Json(mut raw) = payload?;
  // The key decides where the event lands, not the body.
  raw.project_id = Some(env.project_id);
  raw.environment_id = Some(env.id);

  let outcome = state.engine.ingest(&raw, env.notifications())?;
  if let Some(intent) = outcome.alert.clone() {
    state.dispatcher.spawn(env, intent);
  }

  Ok((
    StatusCode::CREATED,
    Json(IngestResponse {
      success: true,
      occurrence_id: outcome.occurrence_id,
      group_id: outcome.group_id,
      duplicate: outcome.duplicate,
    }),
  ))
}

// ---------------------------------------------------------------------------
// Error groups
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
  pub environment_id: Option<i64>,
  pub status: Option<String>,
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

fn page_limit(limit: Option<usize>) -> usize {
  limit.filter(|l| *l > 0).unwrap_or(GroupFilter::DEFAULT_LIMIT).min(MAX_PAGE)
}

/// Trimmed, non-empty query value.
fn present(value: &Option<String>) -> Option<&str> {
  value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub async fn list_groups(
  State(state): Shared,
  Path(project_id): Path<i64>,
  query: Result<Query<GroupQuery>, QueryRejection>,
) -> Result<Json<Vec<ErrorGroup>>, ApiError> {
  let Query(query) = query?;
  let status = match present(&query.status) {
    Some(s) => Some(
      GroupStatus::from_str_loose(s)
        .ok_or_else(|| EngineError::validation("status", "expected unresolved|resolved|ignored"))?,
    ),
    None => None,
  };

  let filter = GroupFilter {
    project_id,
    environment_id: query.environment_id,
    status,
    limit: page_limit(query.limit),
    offset: query.offset.unwrap_or(0),
  };
  Ok(Json(state.engine.list_groups(&filter)?))
}

pub async fn get_group(
  State(state): Shared,
  Path((project_id, group_id)): Path<(i64, i64)>,
) -> Result<Json<ErrorGroup>, ApiError> {
  Ok(Json(state.engine.group(project_id, group_id)?))
}

pub async fn group_occurrences(
  State(state): Shared,
  Path((project_id, group_id)): Path<(i64, i64)>,
  query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<ErrorLog>>, ApiError> {
  let Query(query) = query?;
  let logs = state.engine.occurrences(
    project_id,
    group_id,
    page_limit(query.limit),
    query.offset.unwrap_or(0),
  )?;
  Ok(Json(logs))
}

fn acting_user(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
  let Some(raw) = headers.get(USER_ID_HEADER) else {
    return Ok(None);
  };
  raw
    .to_str()
    .ok()
    .and_then(|v| v.trim().parse::<i64>().ok())
    .map(Some)
    .ok_or_else(|| EngineError::validation("X-User-Id", "must be an integer").into())
}

async fn change_status(
  state: &AppState,
  project_id: i64,
  group_id: i64,
  headers: &HeaderMap,
  to: GroupStatus,
) -> Result<Json<ErrorGroup>, ApiError> {
  let actor = acting_user(headers)?;
  state.engine.group(project_id, group_id)?;
  Ok(Json(state.engine.set_status(group_id, to, actor)?))
}

pub async fn resolve_group(
  State(state): Shared,
  Path((project_id, group_id)): Path<(i64, i64)>,
  headers: HeaderMap,
) -> Result<Json<ErrorGroup>, ApiError> {
  change_status(&state, project_id, group_id, &headers, GroupStatus::Resolved).await
}

pub async fn ignore_group(
  State(state): Shared,
  Path((project_id, group_id)): Path<(i64, i64)>,
  headers: HeaderMap,
) -> Result<Json<ErrorGroup>, ApiError> {
  change_status(&state, project_id, group_id, &headers, GroupStatus::Ignored).await
}

pub async fn reopen_group(
  State(state): Shared,
  Path((project_id, group_id)): Path<(i64, i64)>,
  headers: HeaderMap,
) -> Result<Json<ErrorGroup>, ApiError> {
  change_status(&state, project_id, group_id, &headers, GroupStatus::Unresolved).await
}

// ---------------------------------------------------------------------------
// Individual occurrences
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ErrorQuery {
  pub level: Option<String>,
  pub source: Option<String>,
  pub environment_id: Option<i64>,
  pub error_group_id: Option<i64>,
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

/// Occurrences across the project, newest first.
pub async fn list_errors(
  State(state): Shared,
  Path(project_id): Path<i64>,
  query: Result<Query<ErrorQuery>, QueryRejection>,
) -> Result<Json<Vec<ErrorLog>>, ApiError> {
  let Query(query) = query?;
  let level = match present(&query.level) {
    Some(s) => Some(
      Level::from_str_loose(s).ok_or_else(|| EngineError::validation("level", "expected error|warn|info"))?,
    ),
    None => None,
  };
  let source = match present(&query.source) {
    Some(s) => Some(
      Source::from_str_loose(s)
        .ok_or_else(|| EngineError::validation("source", "expected frontend|backend"))?,
    ),
    None => None,
  };

  let filter = OccurrenceFilter {
    project_id,
    environment_id: query.environment_id,
    error_group_id: query.error_group_id,
    level,
    source,
    limit: query
      .limit
      .filter(|l| *l > 0)
      .unwrap_or(OccurrenceFilter::DEFAULT_LIMIT)
      .min(MAX_OCCURRENCE_PAGE),
    offset: query.offset.unwrap_or(0),
  };
  Ok(Json(state.engine.list_occurrences(&filter)?))
}

#[derive(Debug, Deserialize)]
pub struct ResolvePayload {
  pub resolved: bool,
}

pub async fn get_error(
  State(state): Shared,
  Path((project_id, error_id)): Path<(i64, i64)>,
) -> Result<Json<ErrorLog>, ApiError> {
  Ok(Json(state.engine.occurrence(project_id, error_id)?))
}

pub async fn resolve_error(
  State(state): Shared,
  Path((project_id, error_id)): Path<(i64, i64)>,
  payload: Result<Json<ResolvePayload>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
  let Json(payload) = payload?;
  state
    .engine
    .set_occurrence_resolved(project_id, error_id, payload.resolved)?;
  Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateEnvironment {
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
}

pub async fn list_environments(
  State(state): Shared,
  Path(project_id): Path<i64>,
) -> Result<Json<Vec<Environment>>, ApiError> {
  Ok(Json(state.engine.environments().list(project_id)?))
}

pub async fn create_environment(
  State(state): Shared,
  Path(project_id): Path<i64>,
  payload: Result<Json<CreateEnvironment>, JsonRejection>,
) -> Result<(StatusCode, Json<Environment>), ApiError> {
  let Json(payload) = payload?;
  let env = state
    .engine
    .environments()
    .create(project_id, &payload.name, payload.description)?;
  Ok((StatusCode::CREATED, Json(env)))
}

pub async fn get_environment(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
) -> Result<Json<Environment>, ApiError> {
  Ok(Json(state.engine.environments().get(project_id, env_id)?))
}

pub async fn update_environment(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
  payload: Result<Json<EnvironmentUpdate>, JsonRejection>,
) -> Result<Json<Environment>, ApiError> {
  let Json(update) = payload?;
  Ok(Json(state.engine.environments().update(project_id, env_id, update)?))
}

pub async fn delete_environment(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
  state.engine.environments().delete(project_id, env_id)?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn rotate_key(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
  let env = state.engine.environments().rotate_key(project_id, env_id)?;
  Ok(Json(json!({ "api_key": env.api_key })))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub async fn test_notification(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
  let env = state.engine.environments().get(project_id, env_id)?;
  let reply = match state.dispatcher.send_test(&env).await {
    Ok(()) => (
      StatusCode::OK,
      Json(json!({
        "success": true,
        "message": "Test notification sent successfully! Check your Telegram group.",
      })),
    ),
    Err(e) => (
      StatusCode::BAD_REQUEST,
      Json(json!({ "success": false, "message": e.to_string() })),
    ),
  };
  Ok(reply)
}

/// One alerted group, as listed in the notification history.
#[derive(Debug, Serialize)]
pub struct NotifiedGroup {
  pub error_group_id: i64,
  pub message: String,
  pub level: Level,
  pub notification_count: u64,
  pub occurrence_count: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_notified_at: Option<DateTime<Utc>>,
}

impl From<ErrorGroup> for NotifiedGroup {
  fn from(group: ErrorGroup) -> Self {
    Self {
      error_group_id: group.id,
      message: group.message,
      level: group.level,
      notification_count: group.notification_count,
      occurrence_count: group.occurrence_count,
      last_notified_at: group.last_notified_at,
    }
  }
}

/// Groups of the environment that were alerted on, most recently notified first.
pub async fn notification_history(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<NotifiedGroup>>, ApiError> {
  state.engine.environments().get(project_id, env_id)?;
  let groups = state.engine.notified_groups(project_id, env_id, HISTORY_LIMIT)?;
  Ok(Json(groups.into_iter().map(NotifiedGroup::from).collect()))
}

/// Every delivery attempt (sent, failed, debounced, test), newest first.
pub async fn notification_deliveries(
  State(state): Shared,
  Path((project_id, env_id)): Path<(i64, i64)>,
  query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
  let Query(query) = query?;
  state.engine.environments().get(project_id, env_id)?;
  Ok(Json(state.dispatcher.deliveries(
    project_id,
    env_id,
    page_limit(query.limit),
  )))
}
