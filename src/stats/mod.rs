mod dto;
pub mod services;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tracing::instrument;

use crate::{error::AppResult, state::AppState};
use dto::StatsResponse;

pub fn router() -> Router<AppState> {
    Router::new().route("/stats/:user_id", get(get_stats))
}

/// GET /stats/:user_id
#[instrument(skip(state))]
pub async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<StatsResponse>> {
    Ok(Json(services::get_stats(&state, &user_id).await?))
}
