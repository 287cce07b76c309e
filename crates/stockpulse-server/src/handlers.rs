//! HTTP handlers for the inventory collaborator and health.
//!
//! Repository calls are blocking SQLite work, so each runs on the blocking
//! pool. Change messages are emitted by the repository itself after commit;
//! handlers never talk to the broadcaster.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use stockpulse_store::{InventoryItem, InventoryRepo, NewItem, QuantityUpdate, StoreError};

use crate::error::ApiError;
use crate::server::AppState;

async fn with_repo<T, F>(repo: &Arc<InventoryRepo>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&InventoryRepo) -> Result<T, StoreError> + Send + 'static,
{
    let repo = Arc::clone(repo);
    let result = tokio::task::spawn_blocking(move || f(&repo)).await?;
    Ok(result?)
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "subscribers": state.broadcaster.count(),
        "listener": state.listener.state().as_str(),
    }))
}

pub async fn list_items(State(state): State<AppState>) -> Result<Json<Vec<InventoryItem>>, ApiError> {
    let items = with_repo(&state.repo, |repo| repo.list()).await?;
    Ok(Json(items))
}

pub async fn create_item(
    State(state): State<AppState>,
    Json(body): Json<NewItem>,
) -> Result<(StatusCode, Json<InventoryItem>), ApiError> {
    let item = with_repo(&state.repo, move |repo| repo.create(&body)).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InventoryItem>, ApiError> {
    let item = with_repo(&state.repo, move |repo| repo.get(id)).await?;
    Ok(Json(item))
}

pub async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<QuantityUpdate>,
) -> Result<Json<InventoryItem>, ApiError> {
    let item = with_repo(&state.repo, move |repo| repo.update_quantity(id, body.quantity)).await?;
    Ok(Json(item))
}

pub async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InventoryItem>, ApiError> {
    let item = with_repo(&state.repo, move |repo| repo.delete(id)).await?;
    Ok(Json(item))
}
