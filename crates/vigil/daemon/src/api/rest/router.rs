//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let api_routes = Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        // Streams, samples and patrol
        .route("/users/:user/streams", get(handlers::list_streams))
        .route("/users/:user/touch", post(handlers::touch_topic))
        .route("/users/:user/samples", post(handlers::ingest_sample))
        .route("/users/:user/budget", get(handlers::get_budget))
        .route("/users/:user/patrol", post(handlers::run_patrol))
        .route("/users/:user/escalations", get(handlers::list_escalations))
        // Conditions
        .route(
            "/users/:user/conditions",
            get(handlers::list_conditions).post(handlers::create_condition),
        )
        .route("/users/:user/intents", post(handlers::create_from_intent))
        .route(
            "/conditions/:id",
            get(handlers::get_condition).delete(handlers::delete_condition),
        )
        .route("/conditions/:id/confirm", post(handlers::confirm_condition))
        .route("/conditions/:id/supersede", post(handlers::supersede_condition));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::handlers::{
        DeleteConditionResponse, HealthCheckResponse, SampleResponse,
    };
    use crate::error::ErrorResponse;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use tower::ServiceExt;
    use vigil_monitor::testing::{fakes, Fakes};
    use vigil_monitor::{BudgetStatus, ClassifiedIntent, ManualClock, MonitorConfig, MonitorEngine};
    use vigil_types::{
        AlertPredicate, Comparison, Condition, ConditionOrigin, ConditionPayload, ConditionState,
        JudgmentSpec, Quantity, SampleValue, Stream, TopicKey,
    };

    fn test_router() -> (Router, Fakes) {
        let fakes = fakes();
        let engine = Arc::new(MonitorEngine::with_clock(
            MonitorConfig::default(),
            fakes.collaborators(),
            Arc::new(ManualClock::fixed()),
        ));
        (create_router(AppState::new(engine), true), fakes)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    fn funding_alert() -> serde_json::Value {
        serde_json::json!({
            "payload": ConditionPayload::Alert(AlertPredicate::new(
                TopicKey::funding("BTC"),
                Comparison::Below(Quantity::Percent(-0.1)),
            )),
        })
    }

    #[tokio::test]
    async fn health_returns_200() {
        let (app, _) = test_router();
        let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthCheckResponse = parse(&body);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.streams, 0);
    }

    #[tokio::test]
    async fn create_condition_then_sample_escalates() {
        let (app, fakes) = test_router();

        let (status, body) =
            send(&app, "POST", "/api/v1/users/alice/conditions", Some(funding_alert())).await;
        assert_eq!(status, StatusCode::CREATED);
        let condition: Condition = parse(&body);
        assert_eq!(condition.origin, ConditionOrigin::UserRequest);

        let (status, body) = send(&app, "GET", "/api/v1/users/alice/streams", None).await;
        assert_eq!(status, StatusCode::OK);
        let streams: Vec<Stream> = parse(&body);
        assert_eq!(streams.len(), 1);

        let sample = serde_json::json!({
            "topic": "funding/BTC",
            "value": SampleValue::percent(-0.12),
        });
        let (status, body) =
            send(&app, "POST", "/api/v1/users/alice/samples", Some(sample)).await;
        assert_eq!(status, StatusCode::OK);
        let report: SampleResponse = parse(&body);
        assert!(report.meaningful);
        assert_eq!(report.escalations, 1);

        for _ in 0..100 {
            if fakes.notifier.count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fakes.notifier.count(), 1);

        let (_, body) = send(
            &app,
            "GET",
            &format!("/api/v1/conditions/{}", condition.id),
            None,
        )
        .await;
        let fetched: Condition = parse(&body);
        assert_eq!(fetched.state, ConditionState::Fired);
    }

    #[tokio::test]
    async fn fractional_threshold_is_rejected() {
        let (app, _) = test_router();
        let body = serde_json::json!({
            "payload": ConditionPayload::Alert(AlertPredicate::new(
                TopicKey::funding("BTC"),
                Comparison::Below(Quantity::Absolute(-0.001)),
            )),
        });
        let (status, body) = send(&app, "POST", "/api/v1/users/alice/conditions", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let error: ErrorResponse = parse(&body);
        assert_eq!(error.code, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn sample_for_unknown_stream_is_not_found() {
        let (app, _) = test_router();
        let sample = serde_json::json!({
            "topic": "price/DOGE",
            "value": SampleValue::absolute(0.3),
        });
        let (status, _) = send(&app, "POST", "/api/v1/users/bob/samples", Some(sample)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let bad = serde_json::json!({ "topic": "DOGE", "value": SampleValue::absolute(0.3) });
        let (status, _) = send(&app, "POST", "/api/v1/users/bob/samples", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn touch_creates_hot_stream() {
        let (app, _) = test_router();
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/users/carol/touch",
            Some(serde_json::json!({ "topic": "oi/ETH" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let stream: Stream = parse(&body);
        assert_eq!(stream.temperature, vigil_types::Temperature::Hot);
    }

    #[tokio::test]
    async fn intent_uses_classifier() {
        let (app, fakes) = test_router();
        fakes.classifier.set(ClassifiedIntent {
            payload: ConditionPayload::LlmEvaluated(JudgmentSpec {
                prompt: "tell me if ETH sentiment turns".to_string(),
                data_needed: vec![],
            }),
            description: None,
        });

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/users/dave/intents",
            Some(serde_json::json!({ "message": "tell me if ETH sentiment turns" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let condition: Condition = parse(&body);
        assert_eq!(condition.description, "tell me if ETH sentiment turns");

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/users/dave/intents",
            Some(serde_json::json!({ "message": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn confirm_delete_and_supersede() {
        let (app, _) = test_router();
        let mut body = funding_alert();
        body["origin"] = serde_json::json!("patrol_generated");
        let (_, created) = send(&app, "POST", "/api/v1/users/erin/conditions", Some(body)).await;
        let condition: Condition = parse(&created);

        let uri = format!("/api/v1/conditions/{}", condition.id);
        let (status, body) = send(&app, "POST", &format!("{}/confirm", uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(parse::<Condition>(&body).confirmed_at.is_some());

        let refinement = serde_json::json!({
            "refinement": AlertPredicate::new(
                TopicKey::funding("BTC"),
                Comparison::Below(Quantity::Percent(-0.2)),
            ),
        });
        let (status, body) =
            send(&app, "POST", &format!("{}/supersede", uri), Some(refinement)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(parse::<Condition>(&body).supersedes, Some(condition.id));

        let (status, body) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!parse::<DeleteConditionResponse>(&body).deleted);

        let (status, _) = send(&app, "POST", &format!("{}/confirm", uri), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(
            &app,
            "GET",
            "/api/v1/users/erin/conditions?state=active",
            None,
        )
        .await;
        assert_eq!(parse::<Vec<Condition>>(&body).len(), 1);
    }

    #[tokio::test]
    async fn unknown_condition_is_not_found() {
        let (app, _) = test_router();
        let uri = format!("/api/v1/conditions/{}", uuid::Uuid::new_v4());
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/v1/conditions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn budget_and_patrol() {
        let (app, _) = test_router();
        let (status, body) = send(&app, "GET", "/api/v1/users/frank/budget", None).await;
        assert_eq!(status, StatusCode::OK);
        let budget: BudgetStatus = parse(&body);
        assert_eq!(budget.count, 0);
        assert_eq!(budget.limit, 5);

        let (status, body) = send(&app, "POST", "/api/v1/users/frank/patrol", None).await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = parse(&body);
        assert_eq!(report["user"], "frank");
    }
}
