//! Condition management handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_monitor::NewCondition;
use vigil_types::{
    AlertPredicate, Condition, ConditionId, ConditionOrigin, ConditionPayload, ConditionState,
    UserId,
};

/// List conditions query params
#[derive(Debug, Deserialize)]
pub struct ListConditionsQuery {
    pub state: Option<ConditionState>,
}

/// Create condition request
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConditionRequest {
    pub payload: ConditionPayload,
    #[serde(default)]
    pub origin: Option<ConditionOrigin>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Free-form condition request, classified by the intent collaborator
#[derive(Debug, Serialize, Deserialize)]
pub struct IntentRequest {
    pub message: String,
}

/// Supersede request: a precise Alert replacing a vaguer condition
#[derive(Debug, Serialize, Deserialize)]
pub struct SupersedeRequest {
    pub refinement: AlertPredicate,
    #[serde(default)]
    pub description: Option<String>,
}

/// Delete condition response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteConditionResponse {
    pub deleted: bool,
}

/// List a user's conditions
pub async fn list_conditions(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<ListConditionsQuery>,
) -> Json<Vec<Condition>> {
    let conditions = state
        .engine
        .conditions_for(&UserId::new(user))
        .into_iter()
        .filter(|c| query.state.map_or(true, |s| c.state == s))
        .collect();
    Json(conditions)
}

/// Create a structured condition
pub async fn create_condition(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(request): Json<CreateConditionRequest>,
) -> ApiResult<(StatusCode, Json<Condition>)> {
    let mut new = NewCondition::new(
        request.payload,
        request.origin.unwrap_or(ConditionOrigin::UserRequest),
    );
    new.description = request.description;
    new.expires_at = request.expires_at;

    let condition = state.engine.create(&UserId::new(user), new)?;
    tracing::info!(condition_id = %condition.id, tier = %condition.tier(), "Created condition");
    Ok((StatusCode::CREATED, Json(condition)))
}

/// Create a condition from a free-form message
pub async fn create_from_intent(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(request): Json<IntentRequest>,
) -> ApiResult<(StatusCode, Json<Condition>)> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let condition = state
        .engine
        .create_from_message(&UserId::new(user), &request.message)
        .await?;
    Ok((StatusCode::CREATED, Json(condition)))
}

/// Get a specific condition
pub async fn get_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Condition>> {
    let id = parse_condition_id(&id)?;
    Ok(Json(state.engine.condition(&id)?))
}

/// Delete a condition
pub async fn delete_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteConditionResponse>> {
    let id = parse_condition_id(&id)?;
    let deleted = state.engine.delete(&id)?;
    if deleted {
        tracing::info!(condition_id = %id, "Deleted condition");
    }
    Ok(Json(DeleteConditionResponse { deleted }))
}

/// Confirm a system-originated condition so it is kept past retention
pub async fn confirm_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Condition>> {
    let id = parse_condition_id(&id)?;
    Ok(Json(state.engine.confirm(&id)?))
}

/// Replace a condition with a more precise Alert
pub async fn supersede_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SupersedeRequest>,
) -> ApiResult<(StatusCode, Json<Condition>)> {
    let id = parse_condition_id(&id)?;
    let condition = state
        .engine
        .supersede(&id, request.refinement, request.description)?;
    Ok((StatusCode::CREATED, Json(condition)))
}

fn parse_condition_id(id: &str) -> ApiResult<ConditionId> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid condition ID: {}", id)))
}
