use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::types::ContainerRecord;

/// `GET /api/`: the enabled containers, id and names only.
pub async fn list(State(state): State<AppState>) -> Json<Vec<ContainerRecord>> {
    let snapshot = state.dispatcher.registry().snapshot().await;
    let records = snapshot
        .records()
        .iter()
        .filter(|r| !r.id.trim().is_empty() && !r.names.is_empty())
        .cloned()
        .collect();
    Json(records)
}
