//! HTTP/JSON adapter over the planning engine.
//!
//! Every engine call runs on the blocking pool. The cancellation token of a
//! request is tripped when its handler future is dropped, so a client that
//! disconnects stops the remaining trials at the next checkpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use planner_core::PlannerError;
use planning_engine::PlanningEngine;
use serde::Serialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

mod planning_routes;

pub use planning_routes::planning_routes;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PlanningEngine>,
}

impl AppState {
    pub fn new(engine: PlanningEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    Planner(PlannerError),
    Internal(String),
}

impl From<PlannerError> for AppError {
    fn from(err: PlannerError) -> Self {
        AppError::Planner(err)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Planner(err) => match err {
                PlannerError::Validation { .. }
                | PlannerError::InsufficientData(_)
                | PlannerError::InfeasibleConstraint { .. }
                | PlannerError::NonPositiveDefinite(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PlannerError::Cancelled => StatusCode::CONFLICT,
                PlannerError::Convergence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Planner(err) => err.kind(),
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match &self {
            AppError::Planner(err) => err.to_string(),
            AppError::Internal(message) => message.clone(),
        };
        if status.is_server_error() {
            error!(kind, %message, "request failed");
        }

        let mut detail = json!({ "kind": kind, "message": message });
        if let AppError::Planner(PlannerError::Validation { field, .. }) = &self {
            detail["field"] = json!(field);
        }
        if let AppError::Planner(PlannerError::InfeasibleConstraint { constraint, .. }) = &self {
            detail["constraint"] = json!(constraint);
        }

        (status, Json(json!({ "success": false, "error": detail }))).into_response()
    }
}

async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("ok"))
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(planning_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn init_tracing() {
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let engine = PlanningEngine::from_env()?;
    info!(config = ?engine.config(), "planning engine configured");

    let addr: SocketAddr = std::env::var("PLANNER_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "planning API listening");

    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
}
