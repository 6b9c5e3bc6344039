use planner_core::{Allocation, CancellationToken, PlannerError, PlannerResult, Portfolio};
use tracing::{info, info_span, warn};

use crate::black_litterman::{posterior, BlackLittermanPosterior};
use crate::covariance::{aligned_history, estimate, MarketModel};
use crate::cvar::ScenarioSet;
use crate::diagnostics::{self, by_symbol, rebalancing_plan};
use crate::frontier::{self, sharpe, to_allocation};
use crate::mean_variance::AllocationProblem;
use crate::models::{
    CovarianceSource, FrontierPoint, OptimizationInput, OptimizationResult, OptimizerConfig,
};
use crate::resampling::resample;

/// Everything derived from the input before any allocation is solved.
struct Prepared {
    model: MarketModel,
    problem: AllocationProblem,
    scenarios: Option<ScenarioSet>,
    black_litterman: Option<BlackLittermanPosterior>,
}

pub struct PortfolioOptimizer {
    config: OptimizerConfig,
}

impl PortfolioOptimizer {
    pub fn new(config: OptimizerConfig) -> PlannerResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn optimize(
        &self,
        input: &OptimizationInput,
        cancel: &CancellationToken,
    ) -> PlannerResult<OptimizationResult> {
        input.validate()?;
        let span = info_span!(
            "optimize_portfolio",
            assets = input.assets.len(),
            black_litterman = self.config.use_black_litterman,
            cvar = self.config.use_cvar,
            resampling = self.config.use_resampling
        );
        let _guard = span.enter();

        let prepared = self.prepare(input)?;
        cancel.check()?;
        let model = &prepared.model;
        let scenarios = prepared.scenarios.as_ref();

        let (weights, resamples_used, cvar_cuts) = if self.config.use_resampling {
            let resampled = resample(&prepared.problem, model, scenarios, &self.config, cancel)?;
            (resampled.weights, Some(resampled.used), None)
        } else {
            let solved = prepared.problem.solve(model, scenarios)?;
            let cuts = prepared.problem.cvar_budget().map(|_| solved.cvar_cuts);
            (solved.weights, None, cuts)
        };

        let allocation = to_allocation(&model.symbols, &weights);
        let expected_return = model.portfolio_return(&weights);
        let volatility = model.portfolio_volatility(&weights);

        let mut diagnostics = diagnostics::compute(model, &weights, &input.assets);
        diagnostics.resamples_used = resamples_used;
        diagnostics.cvar_cuts = cvar_cuts;
        if let Some(bl) = &prepared.black_litterman {
            diagnostics.equilibrium_returns = Some(by_symbol(model, &bl.equilibrium_returns));
            diagnostics.posterior_returns = Some(by_symbol(model, &bl.expected_returns));
        }

        let rebalancing = current_allocation(input).map(|current| rebalancing_plan(&allocation, &current));

        info!(
            expected_return,
            volatility,
            diversification = diagnostics.diversification_score,
            "portfolio optimised"
        );
        Ok(OptimizationResult {
            allocation,
            expected_return,
            volatility,
            sharpe_ratio: sharpe(expected_return, volatility, self.config.risk_free_rate),
            diagnostics,
            rebalancing,
        })
    }

    /// Minimum-variance portfolios for `num_points` evenly spaced target
    /// returns. A target return in the input constraints is ignored.
    pub fn efficient_frontier(
        &self,
        input: &OptimizationInput,
        num_points: usize,
        cancel: &CancellationToken,
    ) -> PlannerResult<Vec<FrontierPoint>> {
        input.validate()?;
        let span = info_span!("efficient_frontier", assets = input.assets.len(), num_points);
        let _guard = span.enter();

        let prepared = self.prepare(input)?;
        let points = frontier::trace(
            &prepared.problem,
            &prepared.model,
            prepared.scenarios.as_ref(),
            num_points,
            self.config.risk_free_rate,
            cancel,
        )?;
        info!(points = points.len(), "efficient frontier computed");
        Ok(points)
    }

    fn prepare(&self, input: &OptimizationInput) -> PlannerResult<Prepared> {
        let problem = AllocationProblem::new(&input.assets, &input.constraints, &self.config)?;
        let base = estimate(&input.assets, input.correlation.as_deref(), &self.config)?;

        let (model, black_litterman) = if self.config.use_black_litterman {
            let post = posterior(
                &base,
                &input.assets,
                &input.market_views,
                self.config.tau,
                self.config.risk_aversion,
            )?;
            let model = base.with_moments(post.expected_returns.clone(), post.covariance.clone());
            (model, Some(post))
        } else {
            if !input.market_views.is_empty() {
                warn!(
                    views = input.market_views.len(),
                    "market views ignored because Black-Litterman is disabled"
                );
            }
            (base, None)
        };

        let scenarios = match problem.cvar_budget() {
            None => None,
            Some(_) => Some(self.scenarios(input, &model)?),
        };

        Ok(Prepared {
            model,
            problem,
            scenarios,
            black_litterman,
        })
    }

    /// Historical per-period returns when the covariance is historical,
    /// otherwise simulated annual returns from the model.
    fn scenarios(&self, input: &OptimizationInput, model: &MarketModel) -> PlannerResult<ScenarioSet> {
        match self.config.covariance_source {
            CovarianceSource::Historical => {
                let history = aligned_history(&input.assets).ok_or_else(|| {
                    PlannerError::InsufficientData("CVaR scenarios need aligned return histories".to_string())
                })?;
                ScenarioSet::from_history(&history)
            }
            CovarianceSource::Assumed => {
                ScenarioSet::simulate(model, self.config.cvar_scenarios, self.config.seed)
            }
        }
    }
}

/// Allocation to rebalance from: the caller's, or the one implied by market values.
fn current_allocation(input: &OptimizationInput) -> Option<Allocation> {
    if let Some(current) = &input.current_allocation {
        return Some(current.clone());
    }
    let held = Portfolio::new(input.assets.clone()).current_allocation();
    (!held.is_empty()).then_some(held)
}
