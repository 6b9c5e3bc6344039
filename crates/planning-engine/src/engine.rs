use chrono::Utc;
use monte_carlo::{compare_scenarios, run_monte_carlo, MonteCarloOutput, ScenarioComparison};
use planner_core::{CancellationToken, PlannerResult};
use portfolio_optimizer::{FrontierPoint, OptimizationResult, PortfolioOptimizer};
use tax_optimizer::{TaxProjection, TaxStrategy};
use tracing::{debug, info_span};

use crate::config::EngineConfig;
use crate::requests::{
    FrontierRequest, OptimizeRequest, ScenarioRequest, SimulationRequest, TaxProjectionRequest,
    TaxStrategyRequest,
};

/// Entry point for the planning operations. Stateless apart from the
/// engine-wide defaults; every call is an independent computation.
#[derive(Debug, Clone, Default)]
pub struct PlanningEngine {
    config: EngineConfig,
}

impl PlanningEngine {
    pub fn new(config: EngineConfig) -> PlannerResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn from_env() -> PlannerResult<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn optimize_portfolio(
        &self,
        request: &OptimizeRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<OptimizationResult> {
        let span = info_span!("engine.optimize_portfolio");
        let _guard = span.enter();
        let config = self.config.optimizer_config().merge(&request.config);
        PortfolioOptimizer::new(config)?.optimize(&request.input, cancel)
    }

    pub fn run_monte_carlo(
        &self,
        request: &SimulationRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<MonteCarloOutput> {
        let span = info_span!("engine.run_monte_carlo");
        let _guard = span.enter();
        let config = self.config.monte_carlo_config().merge(&request.config);
        run_monte_carlo(&request.input, &config, cancel)
    }

    /// Base projection and every scenario share the engine seed unless a
    /// scenario overrides it.
    pub fn compare_scenarios(
        &self,
        request: &ScenarioRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<ScenarioComparison> {
        let span = info_span!("engine.compare_scenarios", scenarios = request.scenarios.len());
        let _guard = span.enter();
        let config = self.config.monte_carlo_config().merge(&request.config);
        compare_scenarios(&request.input, &config, &request.scenarios, cancel)
    }

    /// Evaluates as of today when the request carries no date.
    pub fn compute_tax_strategy(&self, request: &TaxStrategyRequest) -> PlannerResult<TaxStrategy> {
        let span = info_span!("engine.compute_tax_strategy");
        let _guard = span.enter();
        let mut config = self.config.tax_config().merge(&request.config);
        if config.as_of.is_none() {
            let today = Utc::now().date_naive();
            debug!(%today, "no as_of supplied, using current date");
            config = config.with_as_of(today);
        }
        tax_optimizer::compute_tax_strategy(&request.portfolio, &request.tax_rates, &config)
    }

    pub fn project_tax_liability(&self, request: &TaxProjectionRequest) -> PlannerResult<TaxProjection> {
        let span = info_span!("engine.project_tax_liability");
        let _guard = span.enter();
        let config = self.config.tax_config().merge(&request.config);
        tax_optimizer::project_tax_liability(&request.portfolio, &request.tax_rates, &config)
    }

    pub fn compute_efficient_frontier(
        &self,
        request: &FrontierRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<Vec<FrontierPoint>> {
        let num_points = request.num_points.unwrap_or(self.config.frontier_points);
        let span = info_span!("engine.compute_efficient_frontier", num_points);
        let _guard = span.enter();
        let config = self.config.optimizer_config().merge(&request.config);
        PortfolioOptimizer::new(config)?.efficient_frontier(&request.input, num_points, cancel)
    }
}
