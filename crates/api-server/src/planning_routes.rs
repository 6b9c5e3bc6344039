//! Planning API Routes
//!
//! One POST endpoint per engine operation. Request bodies are the engine's
//! request types; each carries optional per-call config overrides.

use axum::{extract::State, routing::post, Json, Router};
use monte_carlo::{MonteCarloOutput, ScenarioComparison};
use planner_core::{CancellationToken, PlannerResult};
use planning_engine::{
    FrontierRequest, OptimizeRequest, PlanningEngine, ScenarioRequest, SimulationRequest,
    TaxProjectionRequest, TaxStrategyRequest,
};
use portfolio_optimizer::{FrontierPoint, OptimizationResult};
use tax_optimizer::{TaxProjection, TaxStrategy};

use crate::{ApiResponse, AppError, AppState};

pub fn planning_routes() -> Router<AppState> {
    Router::new()
        .route("/api/portfolio/optimize", post(optimize_portfolio))
        .route("/api/portfolio/efficient-frontier", post(efficient_frontier))
        .route("/api/simulation/monte-carlo", post(monte_carlo))
        .route("/api/simulation/scenarios", post(compare_scenarios))
        .route("/api/tax/strategy", post(tax_strategy))
        .route("/api/tax/projection", post(tax_projection))
}

/// Trips the token when the handler future is dropped before completion.
struct CancelOnDrop(Option<CancellationToken>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}

/// Run an engine call on the blocking pool.
async fn run_blocking<T, F>(state: &AppState, call: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&PlanningEngine, &CancellationToken) -> PlannerResult<T> + Send + 'static,
{
    let engine = state.engine.clone();
    let cancel = CancellationToken::new();
    let guard = CancelOnDrop(Some(cancel.clone()));

    let result = tokio::task::spawn_blocking(move || call(&engine, &cancel))
        .await
        .map_err(|e| AppError::Internal(format!("engine task failed: {}", e)))?;
    guard.disarm();
    Ok(result?)
}

async fn optimize_portfolio(
    State(state): State<AppState>,
    Json(request): Json<OptimizeRequest>,
) -> Result<Json<ApiResponse<OptimizationResult>>, AppError> {
    let result = run_blocking(&state, move |engine, cancel| {
        engine.optimize_portfolio(&request, cancel)
    })
    .await?;
    Ok(Json(ApiResponse::success(result)))
}

async fn efficient_frontier(
    State(state): State<AppState>,
    Json(request): Json<FrontierRequest>,
) -> Result<Json<ApiResponse<Vec<FrontierPoint>>>, AppError> {
    let points = run_blocking(&state, move |engine, cancel| {
        engine.compute_efficient_frontier(&request, cancel)
    })
    .await?;
    Ok(Json(ApiResponse::success(points)))
}

async fn monte_carlo(
    State(state): State<AppState>,
    Json(request): Json<SimulationRequest>,
) -> Result<Json<ApiResponse<MonteCarloOutput>>, AppError> {
    let output = run_blocking(&state, move |engine, cancel| {
        engine.run_monte_carlo(&request, cancel)
    })
    .await?;
    Ok(Json(ApiResponse::success(output)))
}

async fn compare_scenarios(
    State(state): State<AppState>,
    Json(request): Json<ScenarioRequest>,
) -> Result<Json<ApiResponse<ScenarioComparison>>, AppError> {
    let comparison = run_blocking(&state, move |engine, cancel| {
        engine.compare_scenarios(&request, cancel)
    })
    .await?;
    Ok(Json(ApiResponse::success(comparison)))
}

async fn tax_strategy(
    State(state): State<AppState>,
    Json(request): Json<TaxStrategyRequest>,
) -> Result<Json<ApiResponse<TaxStrategy>>, AppError> {
    let strategy = run_blocking(&state, move |engine, _cancel| {
        engine.compute_tax_strategy(&request)
    })
    .await?;
    Ok(Json(ApiResponse::success(strategy)))
}

async fn tax_projection(
    State(state): State<AppState>,
    Json(request): Json<TaxProjectionRequest>,
) -> Result<Json<ApiResponse<TaxProjection>>, AppError> {
    let projection = run_blocking(&state, move |engine, _cancel| {
        engine.project_tax_liability(&request)
    })
    .await?;
    Ok(Json(ApiResponse::success(projection)))
}
