use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use factor_core::FactorError;
use factor_data::StoreConfig;
use factor_runtime::{AppContext, SchedulerConfig};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

pub mod factor_routes;
pub mod result_routes;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

/// Uniform response envelope: `{code, message, data?}` with 3-digit string
/// codes mirroring HTTP semantics.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(ApiResponse {
            code: "200".to_string(),
            message: "ok".to_string(),
            data: Some(data),
        })
    }

    pub fn success_with_message(message: impl Into<String>, data: T) -> Json<Self> {
        Json(ApiResponse {
            code: "200".to_string(),
            message: message.into(),
            data: Some(data),
        })
    }
}

/// Error wrapper mapping the typed error kinds onto envelope codes and
/// matching HTTP statuses.
pub enum AppError {
    Factor(FactorError),
    Conflict(String),
}

impl From<FactorError> for AppError {
    fn from(err: FactorError) -> Self {
        AppError::Factor(err)
    }
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::Factor(FactorError::DataAvailability(message.into()))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict(message.into())
    }

    fn envelope(&self) -> (&'static str, StatusCode, String) {
        match self {
            AppError::Conflict(message) => ("409", StatusCode::CONFLICT, message.clone()),
            AppError::Factor(err) => {
                let (code, status) = match err {
                    FactorError::Validation(_) => ("400", StatusCode::BAD_REQUEST),
                    FactorError::DataAvailability(_) => ("404", StatusCode::NOT_FOUND),
                    FactorError::Computation { .. } | FactorError::Transport(_) | FactorError::Internal(_) => {
                        ("500", StatusCode::INTERNAL_SERVER_ERROR)
                    }
                };
                (code, status, err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, status, message) = self.envelope();
        tracing::warn!(code, %message, "request failed");
        let body = Json(ApiResponse::<serde_json::Value> {
            code: code.to_string(),
            message,
            data: None,
        });
        (status, body).into_response()
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .merge(factor_routes::factor_routes())
        .merge(result_routes::result_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bootstrap and serve until ctrl-c, then drain the log hub.
pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store_config = StoreConfig::from_env();
    let scheduler_config = SchedulerConfig {
        max_concurrent_tasks: std::env::var("MAX_CONCURRENT_TASKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4),
    };

    let ctx = AppContext::initialize(&store_config, scheduler_config).await?;
    let state = AppState { ctx: ctx.clone() };

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8111".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "factor server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    ctx.shutdown().await;
    Ok(())
}
