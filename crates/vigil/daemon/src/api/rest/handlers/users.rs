//! Per-user stream, sample, budget and patrol handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use vigil_monitor::{BudgetStatus, PatrolReport};
use vigil_types::{ConditionId, EscalationRecord, SampleValue, Stream, TopicKey, UserId};

/// Topic reference request
#[derive(Debug, Serialize, Deserialize)]
pub struct TouchRequest {
    /// `kind/subject`, e.g. `funding/BTC`
    pub topic: String,
}

/// Observed sample request
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleRequest {
    pub topic: String,
    pub value: SampleValue,
}

/// What an ingested sample caused. Escalations keep running after the
/// response is sent.
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleResponse {
    pub topic: String,
    pub meaningful: bool,
    pub evaluated: usize,
    pub rearmed: Vec<ConditionId>,
    pub escalations: usize,
    pub deduplicated: Vec<ConditionId>,
}

pub(crate) fn parse_topic(topic: &str) -> ApiResult<TopicKey> {
    topic
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid topic {}: {}", topic, e)))
}

/// List a user's streams
pub async fn list_streams(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<Vec<Stream>> {
    Json(state.engine.streams_for(&UserId::new(user)))
}

/// Record a user reference to a topic (the stream becomes Hot)
pub async fn touch_topic(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(request): Json<TouchRequest>,
) -> ApiResult<Json<Stream>> {
    let topic = parse_topic(&request.topic)?;
    Ok(Json(state.engine.touch(&UserId::new(user), &topic)))
}

/// Feed one observed value into a user's stream
pub async fn ingest_sample(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(request): Json<SampleRequest>,
) -> ApiResult<Json<SampleResponse>> {
    let topic = parse_topic(&request.topic)?;
    let report = state
        .engine
        .ingest(&UserId::new(user), &topic, request.value)?;

    Ok(Json(SampleResponse {
        topic: topic.to_string(),
        meaningful: report.meaningful,
        evaluated: report.evaluations.len(),
        rearmed: report.rearmed.clone(),
        escalations: report.escalations.len(),
        deduplicated: report.deduplicated.clone(),
    }))
}

/// Today's notification budget for a user
pub async fn get_budget(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<BudgetStatus> {
    Json(state.engine.budget_status(&UserId::new(user)))
}

/// Run one patrol for a user now
pub async fn run_patrol(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<PatrolReport> {
    let user = UserId::new(user);
    let report = state.engine.patrol_user(&user).await;
    tracing::info!(
        user = %user,
        failed_steps = report.failed_steps.len(),
        "Patrol requested via API"
    );
    Json(report)
}

/// Recent escalation outcomes for a user
pub async fn list_escalations(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<Vec<EscalationRecord>> {
    Json(state.engine.escalations_for(&UserId::new(user)))
}
