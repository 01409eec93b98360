/// Process instance endpoints
///
/// Launch instances, inspect them, deliver external messages on the
/// channels they wait on, and request termination. This is a management
/// surface: partner transports post replies through the same delivery route.

use crate::api::processes::AppState;
use crate::persistence::InstanceSummary;
use crate::runtime::{
    channel::{ChannelId, Message},
    engine::{InstanceView, ProcessEngineError},
    host::{HostError, InstanceStatus, PassReport},
    EngineError,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Request body for launching an instance
#[derive(Debug, Default, Deserialize)]
pub struct LaunchRequest {
    /// Written to the process variable "input" before the first pass
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/processes/{id}/instances", post(launch_instance))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/effects", get(get_effects))
        .route("/api/instances/{id}/channels/{channel}", post(deliver_message))
        .route("/api/instances/{id}/terminate", post(terminate_instance))
}

/// Map engine errors onto HTTP status codes
fn error_status(error: &ProcessEngineError) -> StatusCode {
    match error {
        ProcessEngineError::ProcessNotFound(_) | ProcessEngineError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        ProcessEngineError::InstanceFinished(_) | ProcessEngineError::DefinitionChanged { .. } => StatusCode::CONFLICT,
        ProcessEngineError::NotExternal(_) => StatusCode::BAD_REQUEST,
        ProcessEngineError::Host(HostError::Engine(
            EngineError::UnknownChannel(_) | EngineError::ChannelCapability { .. } | EngineError::InvalidMessage { .. },
        )) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ProcessEngineError) -> (StatusCode, Json<Value>) {
    let status = error_status(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ Instance operation failed: {}", error);
    } else {
        tracing::warn!("⚠️ Instance operation rejected: {}", error);
    }
    (status, Json(json!({ "error": error.to_string() })))
}

fn parse_instance_id(id: &str) -> Result<Uuid, (StatusCode, Json<Value>)> {
    Uuid::parse_str(id).map_err(|_| (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid instance id" }))))
}

/// POST /api/processes/{id}/instances
/// Body (optional): { "input": {...} }
async fn launch_instance(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<InstanceView>), (StatusCode, Json<Value>)> {
    let request = if body.trim().is_empty() {
        LaunchRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid launch payload for {}: {}", process_id, e);
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        })?
    };

    let view = state.engine.launch(&process_id, request.input).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/instances?status=running
async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, StatusCode> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(InstanceStatus::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
    };
    let instances: Vec<InstanceSummary> = state.engine.database().list_instances(status).await.map_err(|e| {
        tracing::error!("Failed to list instances: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(json!({ "instances": instances })))
}

/// GET /api/instances/{id}
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, (StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    state.engine.status(id).await.map(Json).map_err(reject)
}

/// GET /api/instances/{id}/effects
async fn get_effects(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    let effects = state
        .engine
        .database()
        .load_effects(id)
        .await
        .map_err(|e| reject(ProcessEngineError::Storage(e)))?;
    Ok(Json(json!({ "effects": effects })))
}

/// POST /api/instances/{id}/channels/{channel}
/// Body: a message, e.g. { "type": "invoke_response", "payload": {...} }
async fn deliver_message(
    State(state): State<AppState>,
    Path((id, channel)): Path<(String, u64)>,
    Json(message): Json<Message>,
) -> Result<Json<PassReport>, (StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    tracing::info!("📥 Delivering '{}' to {} on ch{}", message.label(), id, channel);
    state
        .engine
        .deliver(id, ChannelId(channel), message)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /api/instances/{id}/terminate
async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PassReport>, (StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    state.engine.terminate(id).await.map(Json).map_err(reject)
}
