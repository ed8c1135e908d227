use std::cmp::Ordering;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use factor_core::{
    now_iso, CodeType, FactorDefinition, FactorStatus, MetricRow, OneGroupData, Params,
    ResultBundle,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{ApiResponse, AppError, AppState};

pub fn factor_routes() -> Router<AppState> {
    Router::new()
        .route("/api/factor/create", post(create_factor))
        .route("/api/factor/update/:factor_id", post(update_factor))
        .route("/api/factor/delete/:factor_id", get(delete_factor))
        .route("/api/factor/list", get(user_factor_list))
        .route("/api/factor/run/:factor_id", get(run_factor))
        .route("/api/factor/status/:factor_id", get(query_factor_status))
        .route("/api/factor/:factor_id", get(query_factor))
        .route("/api/task/status/:task_id", get(query_task_status))
        .route("/api/task/logs/:task_id", get(task_logs))
}

#[derive(Debug, Deserialize)]
pub struct FactorRequest {
    pub user_id: String,
    pub name: String,
    pub factor_name: String,
    pub code: String,
    pub code_type: CodeType,
    pub params: Params,
}

/// Create a factor definition. Duplicate `(user_id, factor_name)` is a 409.
async fn create_factor(
    State(state): State<AppState>,
    Json(request): Json<FactorRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let ctx = &state.ctx;
    if ctx
        .factors
        .exists_by_name(&request.user_id, &request.factor_name, None)
        .await?
    {
        return Err(AppError::conflict(format!(
            "factor {} already exists for this user",
            request.factor_name
        )));
    }

    let now = now_iso();
    let definition = FactorDefinition {
        id: None,
        user_id: request.user_id,
        name: request.name,
        factor_name: request.factor_name,
        code: request.code,
        code_type: request.code_type,
        params: request.params,
        status: FactorStatus::Idle,
        current_task_id: None,
        created_at: now.clone(),
        updated_at: now,
    };
    let factor_id = ctx.factors.insert(&definition).await?;
    tracing::info!(factor_id = %factor_id, factor_name = %definition.factor_name, "factor created");
    Ok(ApiResponse::success_with_message(
        "factor created",
        json!({ "factor_id": factor_id }),
    ))
}

/// Replace a factor's definition, keeping its creation time and run state.
async fn update_factor(
    State(state): State<AppState>,
    Path(factor_id): Path<String>,
    Json(request): Json<FactorRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let ctx = &state.ctx;
    let existing = ctx
        .factors
        .find_by_id(&factor_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("factor {factor_id} not found")))?;

    if ctx
        .factors
        .exists_by_name(&request.user_id, &request.factor_name, Some(&factor_id))
        .await?
    {
        return Err(AppError::conflict(format!(
            "factor {} already exists for this user",
            request.factor_name
        )));
    }

    let updated = FactorDefinition {
        id: existing.id,
        user_id: request.user_id,
        name: request.name,
        factor_name: request.factor_name,
        code: request.code,
        code_type: request.code_type,
        params: request.params,
        status: existing.status,
        current_task_id: existing.current_task_id,
        created_at: existing.created_at,
        updated_at: now_iso(),
    };
    ctx.factors.replace(&factor_id, &updated).await?;
    Ok(ApiResponse::success_with_message(
        "factor updated",
        json!({ "factor_id": factor_id }),
    ))
}

async fn delete_factor(
    State(state): State<AppState>,
    Path(factor_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    if state.ctx.factors.delete(&factor_id).await? {
        Ok(ApiResponse::success_with_message(
            "factor deleted",
            json!({ "factor_id": factor_id }),
        ))
    } else {
        Err(AppError::not_found(format!("factor {factor_id} not found")))
    }
}

async fn query_factor(
    State(state): State<AppState>,
    Path(factor_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let definition = state
        .ctx
        .factors
        .find_by_id(&factor_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("factor {factor_id} not found")))?;
    let mut value = serde_json::to_value(&definition)
        .map_err(|e| factor_core::FactorError::Internal(e.to_string()))?;
    if let Some(object) = value.as_object_mut() {
        object.remove("_id");
        object.insert("factor_id".to_string(), json!(definition.factor_id()));
    }
    Ok(ApiResponse::success(value))
}

async fn query_factor_status(
    State(state): State<AppState>,
    Path(factor_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let definition = state
        .ctx
        .factors
        .find_by_id(&factor_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("factor {factor_id} not found")))?;
    Ok(ApiResponse::success(json!({
        "status": definition.status,
        "task_id": definition.current_task_id,
    })))
}

/// Kick off an evaluation. Admission failures return before any task
/// record exists; success returns the new task id immediately.
async fn run_factor(
    State(state): State<AppState>,
    Path(factor_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let task_id = state.ctx.scheduler.run_factor(&factor_id).await?;
    Ok(ApiResponse::success_with_message(
        "factor evaluation started",
        json!({ "factor_id": factor_id, "task_id": task_id, "status": 1 }),
    ))
}

#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    task_id: String,
    factor_id: String,
    user_id: String,
    factor_name: String,
    status: factor_core::TaskStatus,
    process_status: i32,
    start_time: String,
    end_time: Option<String>,
    error_message: Option<String>,
    last_log_message: Option<String>,
    last_log_time: Option<String>,
    last_log_level: Option<String>,
    current_stage: Option<String>,
}

async fn query_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatusResponse>>, AppError> {
    let task = state
        .ctx
        .tasks
        .find_by_task_id(&task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;
    Ok(ApiResponse::success(TaskStatusResponse {
        task_id: task.task_id,
        factor_id: task.factor_id,
        user_id: task.user_id,
        factor_name: task.factor_name,
        status: task.status,
        process_status: task.process_status,
        start_time: task.start_time,
        end_time: task.end_time,
        error_message: task.error_message,
        last_log_message: task.last_log_message,
        last_log_time: task.last_log_time,
        last_log_level: task.last_log_level,
        current_stage: task.current_stage,
    }))
}

#[derive(Debug, Deserialize)]
struct TaskLogsQuery {
    last_log_id: Option<String>,
}

/// Incremental log tail: entries strictly after `last_log_id`, plus the new
/// high-water ordinal.
async fn task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<TaskLogsQuery>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let (entries, last_log_id) = state
        .ctx
        .logs
        .tail(&task_id, query.last_log_id.as_deref())
        .await?;
    let logs: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            json!({
                "message": e.message,
                "loglevel": e.level.as_str(),
                "timestamp": e.timestamp,
            })
        })
        .collect();
    Ok(ApiResponse::success(json!({
        "logs": logs,
        "last_log_id": last_log_id.or(query.last_log_id),
    })))
}

const SORT_FIELDS: [&str; 7] = [
    "updated_at",
    "created_at",
    "return_ratio",
    "sharpe_ratio",
    "maximum_drawdown",
    "IC",
    "IR",
];

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    10
}
fn default_sort_field() -> String {
    "created_at".to_string()
}
fn default_sort_order() -> String {
    "desc".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_sort_field")]
    pub sort_field: String,
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactorListItem {
    pub factor_id: String,
    pub name: String,
    pub factor_name: String,
    pub status: FactorStatus,
    pub created_at: String,
    pub updated_at: String,
    pub return_ratio: f64,
    pub annualized_ratio: f64,
    pub sharpe_ratio: f64,
    pub maximum_drawdown: f64,
    #[serde(rename = "IC")]
    pub ic: f64,
    #[serde(rename = "IR")]
    pub ir: f64,
}

#[derive(Debug, Serialize)]
pub struct FactorListResponse {
    pub data: Vec<FactorListItem>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Pull the sortable metrics out of a factor's current result bundle;
/// everything defaults to zero so sorts always have a total order.
pub(crate) fn derived_metrics(bundle: Option<&ResultBundle>) -> (OneGroupData, f64, f64) {
    let Some(bundle) = bundle else {
        return (OneGroupData::default(), 0.0, 0.0);
    };
    let metric = |name: &str| -> f64 {
        bundle
            .factor_data_analysis
            .iter()
            .find(|row: &&MetricRow| row.metric == name)
            .map(|row| row.value)
            .unwrap_or(0.0)
    };
    (
        bundle.one_group_data.clone(),
        metric("IC_mean"),
        metric("IC_IR"),
    )
}

/// Stable sort + page slice over the materialized list.
pub(crate) fn sort_and_page(
    mut items: Vec<FactorListItem>,
    sort_field: &str,
    descending: bool,
    page: u32,
    page_size: u32,
) -> (Vec<FactorListItem>, u64, u64) {
    let compare = |a: &FactorListItem, b: &FactorListItem| -> Ordering {
        match sort_field {
            "updated_at" => a.updated_at.cmp(&b.updated_at),
            "created_at" => a.created_at.cmp(&b.created_at),
            "return_ratio" => a.return_ratio.total_cmp(&b.return_ratio),
            "sharpe_ratio" => a.sharpe_ratio.total_cmp(&b.sharpe_ratio),
            "maximum_drawdown" => a.maximum_drawdown.total_cmp(&b.maximum_drawdown),
            "IC" => a.ic.total_cmp(&b.ic),
            "IR" => a.ir.total_cmp(&b.ir),
            _ => Ordering::Equal,
        }
    };
    items.sort_by(|a, b| {
        let ordering = compare(a, b);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });

    let total = items.len() as u64;
    let total_pages = (total + page_size as u64 - 1) / page_size as u64;
    let start = ((page as u64 - 1) * page_size as u64) as usize;
    let paged = if start >= items.len() {
        Vec::new()
    } else {
        let end = (start + page_size as usize).min(items.len());
        items[start..end].to_vec()
    };
    (paged, total, total_pages)
}

/// A user's factors with pagination and server-side ordering over metrics
/// derived from each factor's current result bundle.
async fn user_factor_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<FactorListResponse>>, AppError> {
    if query.page < 1 {
        return Err(factor_core::FactorError::Validation("page must be >= 1".to_string()).into());
    }
    if !(1..=100).contains(&query.page_size) {
        return Err(factor_core::FactorError::Validation(
            "page_size must be between 1 and 100".to_string(),
        )
        .into());
    }
    if !SORT_FIELDS.contains(&query.sort_field.as_str()) {
        return Err(factor_core::FactorError::Validation(format!(
            "unsupported sort_field {}",
            query.sort_field
        ))
        .into());
    }
    if !["asc", "desc"].contains(&query.sort_order.as_str()) {
        return Err(factor_core::FactorError::Validation(format!(
            "unsupported sort_order {}",
            query.sort_order
        ))
        .into());
    }

    let ctx = &state.ctx;
    let factors = ctx.factors.find_by_user(&query.user_id).await?;

    let mut items = Vec::with_capacity(factors.len());
    for factor in &factors {
        let bundle = match &factor.current_task_id {
            Some(task_id) => ctx.results.find_by_task_id(task_id).await?,
            None => None,
        };
        let (one_group, ic, ir) = derived_metrics(bundle.as_ref());
        items.push(FactorListItem {
            factor_id: factor.factor_id(),
            name: factor.name.clone(),
            factor_name: factor.factor_name.clone(),
            status: factor.status,
            created_at: factor.created_at.clone(),
            updated_at: factor.updated_at.clone(),
            return_ratio: one_group.return_ratio,
            annualized_ratio: one_group.annualized_ratio,
            sharpe_ratio: one_group.sharpe_ratio,
            maximum_drawdown: one_group.maximum_drawdown,
            ic,
            ir,
        });
    }

    let (data, total, total_pages) = sort_and_page(
        items,
        &query.sort_field,
        query.sort_order == "desc",
        query.page,
        query.page_size,
    );

    Ok(ApiResponse::success(FactorListResponse {
        data,
        total,
        page: query.page,
        page_size: query.page_size,
        total_pages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, ic: f64, created: &str) -> FactorListItem {
        FactorListItem {
            factor_id: id.to_string(),
            name: id.to_string(),
            factor_name: id.to_string(),
            status: FactorStatus::Idle,
            created_at: created.to_string(),
            updated_at: created.to_string(),
            return_ratio: 0.0,
            annualized_ratio: 0.0,
            sharpe_ratio: 0.0,
            maximum_drawdown: 0.0,
            ic,
            ir: 0.0,
        }
    }

    #[test]
    fn sorts_by_metric_descending() {
        let items = vec![
            item("a", 0.1, "2024-01-01"),
            item("b", 0.3, "2024-01-02"),
            item("c", 0.2, "2024-01-03"),
        ];
        let (paged, total, pages) = sort_and_page(items, "IC", true, 1, 10);
        assert_eq!(total, 3);
        assert_eq!(pages, 1);
        let ids: Vec<&str> = paged.iter().map(|i| i.factor_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let items = vec![
            item("first", 0.0, "2024-01-01"),
            item("second", 0.0, "2024-01-01"),
            item("third", 0.0, "2024-01-01"),
        ];
        let (paged, _, _) = sort_and_page(items, "IC", true, 1, 10);
        let ids: Vec<&str> = paged.iter().map(|i| i.factor_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn pagination_slices_and_reports_totals() {
        let items: Vec<FactorListItem> = (0..25)
            .map(|i| item(&format!("f{i:02}"), i as f64, "2024-01-01"))
            .collect();
        let (page2, total, pages) = sort_and_page(items, "IC", false, 2, 10);
        assert_eq!(total, 25);
        assert_eq!(pages, 3);
        assert_eq!(page2.len(), 10);
        assert_eq!(page2[0].factor_id, "f10");
    }

    #[test]
    fn out_of_range_page_is_empty() {
        let items = vec![item("a", 0.0, "2024-01-01")];
        let (paged, total, pages) = sort_and_page(items, "created_at", false, 5, 10);
        assert!(paged.is_empty());
        assert_eq!(total, 1);
        assert_eq!(pages, 1);
    }

    #[test]
    fn missing_bundle_defaults_to_zero_metrics() {
        let (one_group, ic, ir) = derived_metrics(None);
        assert_eq!(one_group.return_ratio, 0.0);
        assert_eq!(ic, 0.0);
        assert_eq!(ir, 0.0);
    }
}
