/// Process definition management REST API endpoints
///
/// Provides CRUD operations for process definitions with hot-reload support.
/// Every save bumps the definition version and swaps it into the registry.

use crate::{
    process::{registry::compile_process, registry::ProcessRegistry, storage::ProcessStorage, types::ProcessDefinition},
    runtime::engine::ProcessEngine,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Definition storage for persistence
    pub storage: ProcessStorage,
    /// Hot-reload registry of linked definitions
    pub registry: Arc<ProcessRegistry>,
    /// Process engine for instance operations
    pub engine: Arc<ProcessEngine>,
}

/// Response for definition creation/update operations
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub id: String,
    pub version: u32,
    pub message: String,
}

/// Create process management routes
pub fn create_process_routes() -> Router<AppState> {
    Router::new()
        .route("/api/processes", get(list_processes).post(create_process))
        .route(
            "/api/processes/{id}",
            get(get_process).put(update_process).delete(delete_process),
        )
}

/// Create a new process definition
///
/// POST /api/processes
/// Body: { "id": "...", "name": "...", "root": 0, "nodes": [...] }
async fn create_process(
    State(state): State<AppState>,
    Json(definition): Json<ProcessDefinition>,
) -> Result<Json<ProcessResponse>, StatusCode> {
    if definition.id.is_empty() || definition.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_process(&definition.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    let version = store_and_reload(&state, definition.clone()).await?;
    tracing::info!("🔥 Created process: {} ({}) v{}", definition.id, definition.name, version);

    Ok(Json(ProcessResponse {
        id: definition.id,
        version,
        message: format!("Process '{}' created successfully", definition.name),
    }))
}

/// Replace an existing process definition
///
/// PUT /api/processes/{id}
/// Running instances of the previous version refuse further passes.
async fn update_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut definition): Json<ProcessDefinition>,
) -> Result<Json<ProcessResponse>, StatusCode> {
    definition.id = id.clone();
    if definition.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_process(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    let version = store_and_reload(&state, definition.clone()).await?;
    tracing::info!("🔥 Hot-reloaded process: {} ({}) v{}", definition.id, definition.name, version);

    Ok(Json(ProcessResponse {
        id: definition.id,
        version,
        message: format!("Process '{}' updated successfully", definition.name),
    }))
}

/// Validate, persist and hot-reload a definition
async fn store_and_reload(state: &AppState, definition: ProcessDefinition) -> Result<u32, StatusCode> {
    if let Err(e) = compile_process(definition.clone()) {
        tracing::warn!("❌ Rejected invalid process '{}': {}", definition.id, e);
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let version = state.storage.save_process(&definition).await.map_err(|e| {
        tracing::error!("Failed to save process: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state.registry.reload_process(&definition.id).await.map_err(|e| {
        tracing::error!("Failed to reload process into registry: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(version)
}

/// List all process definitions
///
/// GET /api/processes
async fn list_processes(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_processes().await {
        Ok(processes) => Ok(Json(json!({ "processes": processes }))),
        Err(e) => {
            tracing::error!("Failed to list processes: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/processes/{id}
async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessDefinition>, StatusCode> {
    match state.storage.get_process(&id).await {
        Ok(Some(definition)) => Ok(Json(definition)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get process {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/processes/{id}
async fn delete_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.registry.remove_process(&id);

    match state.storage.delete_process(&id).await {
        Ok(true) => {
            tracing::info!("Deleted process: {}", id);
            Ok(Json(json!({ "message": "Process deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete process: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
