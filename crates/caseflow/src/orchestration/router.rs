use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::engine::{Engine, SubmitError};
use super::events::EventSubmission;
use super::recommendation::{RecommendationId, RecommendationStatus};
use super::store::{LifecycleError, RepositoryError};

/// Router builder exposing the engine's public operations. Mounted by the
/// api service next to its health and metrics endpoints.
pub fn engine_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/v1/events", post(submit_event_handler))
        .route("/api/v1/recommendations", get(list_handler))
        .route("/api/v1/recommendations/changes", get(changes_handler))
        .route("/api/v1/recommendations/:recommendation_id", get(get_handler))
        .route(
            "/api/v1/recommendations/:recommendation_id/approve",
            post(approve_handler),
        )
        .route(
            "/api/v1/recommendations/:recommendation_id/reject",
            post(reject_handler),
        )
        .route("/api/v1/statistics", get(statistics_handler))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
pub(crate) struct DecisionRequest {
    pub(crate) actor: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    pub(crate) status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChangesQuery {
    #[serde(default)]
    pub(crate) cursor: u64,
    pub(crate) status: Option<String>,
}

fn parse_status(raw: Option<&str>) -> Result<Option<RecommendationStatus>, Response> {
    match raw {
        None => Ok(None),
        Some(value) => match RecommendationStatus::parse(value) {
            Some(status) => Ok(Some(status)),
            None => {
                let payload = json!({ "error": format!("unknown status '{value}'") });
                Err((StatusCode::BAD_REQUEST, axum::Json(payload)).into_response())
            }
        },
    }
}

fn repository_error(err: RepositoryError) -> Response {
    let payload = json!({ "error": err.to_string() });
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
}

fn lifecycle_error(err: LifecycleError) -> Response {
    match err {
        LifecycleError::NotFound(id) => {
            let payload = json!({ "error": format!("recommendation '{id}' not found") });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        LifecycleError::InvalidState { .. } => {
            let payload = json!({ "error": err.to_string() });
            (StatusCode::CONFLICT, axum::Json(payload)).into_response()
        }
        LifecycleError::Repository(inner) => repository_error(inner),
    }
}

pub(crate) async fn submit_event_handler(
    State(engine): State<Arc<Engine>>,
    axum::Json(submission): axum::Json<EventSubmission>,
) -> Response {
    match engine.submit_event(submission) {
        Ok(outcome) => {
            let payload = json!({
                "event_id": outcome.event.id,
                "recommendation_id": outcome.recommendation.as_ref().map(|rec| rec.id.clone()),
            });
            (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
        }
        Err(SubmitError::Validation(err)) => {
            let payload = json!({ "error": err.to_string() });
            (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response()
        }
        Err(other) => {
            let payload = json!({ "error": other.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn list_handler(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match parse_status(query.status.as_deref()) {
        Ok(status) => status,
        Err(response) => return response,
    };
    match engine.list(status) {
        Ok(records) => {
            let views: Vec<_> = records.iter().map(|record| record.view()).collect();
            (StatusCode::OK, axum::Json(views)).into_response()
        }
        Err(err) => repository_error(err),
    }
}

pub(crate) async fn changes_handler(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let status = match parse_status(query.status.as_deref()) {
        Ok(status) => status,
        Err(response) => return response,
    };
    match engine.poll(status, query.cursor) {
        Ok(page) => (StatusCode::OK, axum::Json(page)).into_response(),
        Err(err) => repository_error(err),
    }
}

pub(crate) async fn get_handler(
    State(engine): State<Arc<Engine>>,
    Path(recommendation_id): Path<String>,
) -> Response {
    let id = RecommendationId(recommendation_id);
    match engine.get(&id) {
        Ok(Some(record)) => (StatusCode::OK, axum::Json(record)).into_response(),
        Ok(None) => {
            let payload = json!({ "error": format!("recommendation '{id}' not found") });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(err) => repository_error(err),
    }
}

pub(crate) async fn approve_handler(
    State(engine): State<Arc<Engine>>,
    Path(recommendation_id): Path<String>,
    axum::Json(request): axum::Json<DecisionRequest>,
) -> Response {
    let id = RecommendationId(recommendation_id);
    match engine.approve(&id, &request.actor) {
        Ok(record) => (StatusCode::OK, axum::Json(record)).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

pub(crate) async fn reject_handler(
    State(engine): State<Arc<Engine>>,
    Path(recommendation_id): Path<String>,
    axum::Json(request): axum::Json<DecisionRequest>,
) -> Response {
    let id = RecommendationId(recommendation_id);
    match engine.reject(&id, &request.actor) {
        Ok(record) => (StatusCode::OK, axum::Json(record)).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

pub(crate) async fn statistics_handler(State(engine): State<Arc<Engine>>) -> Response {
    (StatusCode::OK, axum::Json(engine.statistics())).into_response()
}
