use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use factor_core::FactorError;
use serde_json::json;

use crate::{ApiResponse, AppError, AppState};

/// Artifact route names and the bundle fields they read. The names follow
/// the query endpoints; `factor_analysis_data` is the one whose field name
/// differs.
const ARTIFACTS: [(&str, &str); 15] = [
    ("return_chart", "return_chart"),
    ("simple_return_chart", "simple_return_chart"),
    ("excess_chart", "excess_chart"),
    ("factor_analysis_data", "factor_data_analysis"),
    ("group_return_analysis", "group_return_analysis"),
    ("ic_decay_chart", "ic_decay_chart"),
    ("ic_density_chart", "ic_density_chart"),
    ("ic_self_correlation_chart", "ic_self_correlation_chart"),
    ("ic_sequence_chart", "ic_sequence_chart"),
    ("rank_ic_decay_chart", "rank_ic_decay_chart"),
    ("rank_ic_density_chart", "rank_ic_density_chart"),
    ("rank_ic_self_correlation_chart", "rank_ic_self_correlation_chart"),
    ("rank_ic_sequence_chart", "rank_ic_sequence_chart"),
    ("last_date_top_factor", "last_date_top_factor"),
    ("one_group_data", "one_group_data"),
];

pub fn result_routes() -> Router<AppState> {
    Router::new().route("/api/result/:artifact/:task_id", get(query_artifact))
}

pub(crate) fn bundle_field(artifact: &str) -> Option<&'static str> {
    ARTIFACTS
        .iter()
        .find(|(name, _)| *name == artifact)
        .map(|(_, field)| *field)
}

/// Return one named artifact of a task's result bundle, or a 404 envelope
/// when the bundle (or the artifact name) is absent.
async fn query_artifact(
    State(state): State<AppState>,
    Path((artifact, task_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let field = bundle_field(&artifact)
        .ok_or_else(|| AppError::not_found(format!("unknown result artifact {artifact}")))?;

    let bundle = state
        .ctx
        .results
        .find_by_task_id(&task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no analysis result for task {task_id}")))?;

    let mut value = serde_json::to_value(&bundle)
        .map_err(|e| FactorError::Internal(e.to_string()))?;
    let payload = value
        .as_object_mut()
        .and_then(|object| object.remove(field))
        .unwrap_or(serde_json::Value::Null);

    Ok(ApiResponse::success(json!({
        "task_id": task_id,
        artifact: payload,
    })))
}
