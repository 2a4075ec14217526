//! Router assembly.

use axum::middleware;
use axum::routing::{get, patch, post, MethodRouter};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::limit;
use crate::state::AppState;

fn ingest_route(state: &Arc<AppState>) -> MethodRouter<Arc<AppState>> {
  post(handlers::ingest).route_layer(middleware::from_fn_with_state(
    Arc::clone(state),
    limit::limit_ingest,
  ))
}

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(handlers::health))
    // SDK ingestion; both paths share one limiter.
    .route("/api/log", ingest_route(&state))
    .route("/api/ingest", ingest_route(&state))
    // Error groups
    .route("/api/projects/:id/error-groups", get(handlers::list_groups))
    .route("/api/projects/:id/error-groups/:group_id", get(handlers::get_group))
    .route(
      "/api/projects/:id/error-groups/:group_id/occurrences",
      get(handlers::group_occurrences),
    )
    .route(
      "/api/projects/:id/error-groups/:group_id/resolve",
      patch(handlers::resolve_group),
    )
    .route(
      "/api/projects/:id/error-groups/:group_id/ignore",
      patch(handlers::ignore_group),
    )
    .route(
      "/api/projects/:id/error-groups/:group_id/reopen",
      patch(handlers::reopen_group),
    )
    // Individual occurrences
    .route("/api/projects/:id/errors", get(handlers::list_errors))
    .route("/api/projects/:id/errors/:error_id", get(handlers::get_error))
    .route(
      "/api/projects/:id/errors/:error_id/resolve",
      patch(handlers::resolve_error),
    )
    // Environments
    .route(
      "/api/projects/:id/environments",
      get(handlers::list_environments).post(handlers::create_environment),
    )
    .route(
      "/api/projects/:id/environments/:env_id",
      get(handlers::get_environment)
        .patch(handlers::update_environment)
        .delete(handlers::delete_environment),
    )
    .route(
      "/api/projects/:id/environments/:env_id/regenerate-key",
      post(handlers::rotate_key),
    )
    .route(
      "/api/projects/:id/environments/:env_id/rotate-key",
      post(handlers::rotate_key),
    )
    .route(
      "/api/projects/:id/environments/:env_id/notifications/test",
      post(handlers::test_notification),
    )
    .route(
      "/api/projects/:id/environments/:env_id/notifications/history",
      get(handlers::notification_history),
    )
    .route(
      "/api/projects/:id/environments/:env_id/notifications/deliveries",
      get(handlers::notification_deliveries),
    )
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}
