use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use tracing::instrument;

use super::dto::{AnalyzeRequest, DeletedResponse, ResultsQuery, ResultsResponse};
use super::repo_types::{Analysis, ResultRecord};
use super::services;
use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

// base64 inflates by 4/3; leave headroom for the JSON envelope and notes
pub(crate) fn analyze_body_limit(max_image_bytes: usize) -> usize {
    max_image_bytes / 3 * 4 + 256 * 1024
}

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/results", get(list_results))
        .route("/results/:result_id", delete(delete_result))
        .route("/analyses/:analysis_id", get(get_analysis))
}

pub fn write_routes(max_image_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(analyze_body_limit(max_image_bytes)))
}

/// POST /analyze { image, user_id, notes?, analysis_type? }
#[instrument(skip(state, payload))]
pub async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<ResultRecord>)> {
    let Json(payload) = payload?;
    let result = services::analyze(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /results?user_id=...
#[instrument(skip(state, query))]
pub async fn list_results(
    State(state): State<AppState>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> AppResult<Json<ResultsResponse>> {
    let Query(query) = query?;
    let user_id = query
        .user_id
        .ok_or_else(|| AppError::validation("user_id is required"))?;
    let results = services::list_results(&state, &user_id).await?;
    Ok(Json(ResultsResponse { results }))
}

#[instrument(skip(state))]
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> AppResult<Json<Analysis>> {
    Ok(Json(services::get_analysis(&state, &analysis_id).await?))
}

#[instrument(skip(state))]
pub async fn delete_result(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
) -> AppResult<Json<DeletedResponse>> {
    services::delete_result(&state, &result_id).await?;
    Ok(Json(DeletedResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limit_fits_max_image_as_base64() {
        let max = 10 * 1024 * 1024;
        assert!(analyze_body_limit(max) > max * 4 / 3);
    }
}
