use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use caseflow::orchestration::router::engine_router;
use caseflow::orchestration::Engine;
use serde_json::json;
use std::sync::Arc;

/// Engine API plus the service's operational endpoints.
pub(crate) fn app_router(engine: Arc<Engine>) -> axum::Router {
    engine_router(engine)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{build_engine, demo_submission};
    use axum::body::Body;
    use axum::http::Request;
    use caseflow::config::EngineSettings;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body is readable");
        serde_json::from_slice(&bytes).expect("body is json")
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let Json(body) = healthcheck().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn demo_engine_accepts_the_canned_event() {
        let engine =
            build_engine(EngineSettings::default()).expect("demo registry is valid");
        let router = app_router(engine);

        let submission =
            serde_json::to_string(&demo_submission()).expect("submission serializes");
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(submission))
                    .expect("request builds"),
            )
            .await
            .expect("router never errors");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(
            body["recommendation_id"].as_str().is_some(),
            "seeded context matches every indicator"
        );
    }
}
