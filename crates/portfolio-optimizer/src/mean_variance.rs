//! Constrained mean-variance allocation on top of the QP solver.

use nalgebra::{DMatrix, DVector};
use planner_core::{Asset, PlannerError, PlannerResult};
use tracing::{debug, warn};

use crate::covariance::MarketModel;
use crate::cvar::{ScenarioSet, MAX_CUTS};
use crate::models::{CvarBudget, OptimizationConstraints, OptimizerConfig};
use crate::qp::{solve, LinearConstraint, QuadraticProgram};

const BISECTION_STEPS: usize = 40;
const BOUND_TOLERANCE: f64 = 1e-9;
const VOLATILITY_TOLERANCE: f64 = 1e-9;
const RETURN_TOLERANCE: f64 = 1e-9;
const CVAR_TOLERANCE: f64 = 1e-7;

/// Weights in asset order plus the number of CVaR cuts it took to get there.
#[derive(Debug, Clone)]
pub struct Allocated {
    pub weights: DVector<f64>,
    pub cvar_cuts: usize,
}

#[derive(Debug, Clone)]
struct SectorCap {
    name: String,
    members: DVector<f64>,
    cap: f64,
}

/// Bounds and risk limits of one optimisation, independent of the market
/// model so the same problem can be re-solved on resampled moments.
#[derive(Debug, Clone)]
pub struct AllocationProblem {
    symbols: Vec<String>,
    lower: DVector<f64>,
    upper: DVector<f64>,
    sector_caps: Vec<SectorCap>,
    target_return: Option<f64>,
    max_volatility: Option<f64>,
    cvar: Option<CvarBudget>,
    risk_aversion: f64,
    max_iterations: usize,
}

impl AllocationProblem {
    /// Collect the constraints and reject sets that are infeasible on their face.
    pub fn new(
        assets: &[Asset],
        constraints: &OptimizationConstraints,
        config: &OptimizerConfig,
    ) -> PlannerResult<Self> {
        let n = assets.len();
        let symbols: Vec<String> = assets.iter().map(|a| a.symbol.clone()).collect();
        let lower = DVector::from_fn(n, |i, _| constraints.min_weight(&symbols[i]));
        let upper = DVector::from_fn(n, |i, _| constraints.max_weight(&symbols[i]));

        for (i, symbol) in symbols.iter().enumerate() {
            if lower[i] > upper[i] + BOUND_TOLERANCE {
                return Err(PlannerError::infeasible(
                    format!("min_weight[{symbol}]"),
                    format!("minimum {} exceeds maximum {}", lower[i], upper[i]),
                ));
            }
        }
        if lower.sum() > 1.0 + BOUND_TOLERANCE {
            return Err(PlannerError::infeasible(
                "min_weight",
                format!("minimum weights sum to {:.4}, above 1", lower.sum()),
            ));
        }
        if upper.sum() < 1.0 - BOUND_TOLERANCE {
            return Err(PlannerError::infeasible(
                "max_weight",
                format!("maximum weights sum to {:.4}, below 1", upper.sum()),
            ));
        }

        let mut sector_caps = Vec::new();
        for (sector, cap) in &constraints.sector_caps {
            let members = DVector::from_fn(n, |i, _| {
                if assets[i].sector.as_deref() == Some(sector.as_str()) {
                    1.0
                } else {
                    0.0
                }
            });
            if members.sum() == 0.0 {
                debug!(sector = %sector, "sector cap matches no asset");
                continue;
            }
            let name = format!("sector_cap[{sector}]");
            let floor = members.dot(&lower);
            if floor > cap + BOUND_TOLERANCE {
                return Err(PlannerError::infeasible(
                    name,
                    format!("minimum weights in sector sum to {floor:.4}, above cap {cap}"),
                ));
            }
            sector_caps.push(SectorCap {
                name,
                members,
                cap: *cap,
            });
        }

        let cvar = match (config.use_cvar, constraints.cvar) {
            (true, Some(budget)) => Some(budget),
            (true, None) => {
                return Err(PlannerError::validation(
                    "constraints.cvar",
                    "a CVaR budget is required when use_cvar is enabled",
                ))
            }
            (false, Some(_)) => {
                warn!("CVaR budget supplied while use_cvar is disabled, ignoring it");
                None
            }
            (false, None) => None,
        };

        Ok(Self {
            symbols,
            lower,
            upper,
            sector_caps,
            target_return: constraints.target_return,
            max_volatility: constraints.max_volatility,
            cvar,
            risk_aversion: config.risk_aversion,
            max_iterations: config.max_iterations,
        })
    }

    /// Same problem pinned to a target return (one efficient-frontier point).
    pub fn with_target(&self, target: f64) -> Self {
        Self {
            target_return: Some(target),
            ..self.clone()
        }
    }

    pub fn cvar_budget(&self) -> Option<CvarBudget> {
        self.cvar
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn solve(&self, model: &MarketModel, scenarios: Option<&ScenarioSet>) -> PlannerResult<Allocated> {
        let mut cuts: Vec<LinearConstraint> = Vec::new();
        let (budget, scenarios) = match (self.cvar, scenarios) {
            (Some(budget), Some(scenarios)) => (budget, scenarios),
            (Some(_), None) => {
                return Err(PlannerError::InsufficientData(
                    "CVaR budget needs a scenario set".to_string(),
                ))
            }
            (None, _) => {
                return Ok(Allocated {
                    weights: self.solve_stage(model, &cuts)?,
                    cvar_cuts: 0,
                })
            }
        };

        loop {
            let weights = self.solve_stage(model, &cuts)?;
            let (cvar, tail) = scenarios.cvar(&weights, budget.alpha);
            if cvar <= budget.max_cvar + CVAR_TOLERANCE {
                debug!(cuts = cuts.len(), cvar, "cvar budget satisfied");
                return Ok(Allocated {
                    weights,
                    cvar_cuts: cuts.len(),
                });
            }
            if cuts.len() >= MAX_CUTS {
                return Err(PlannerError::Convergence(format!(
                    "CVaR {cvar:.4} still above budget {} after {MAX_CUTS} cuts",
                    budget.max_cvar
                )));
            }
            debug!(cut = cuts.len() + 1, cvar, "adding cvar cut");
            cuts.push(scenarios.cut(&tail, budget.max_cvar));
        }
    }

    /// One solve with the current set of CVaR cuts.
    fn solve_stage(&self, model: &MarketModel, cuts: &[LinearConstraint]) -> PlannerResult<DVector<f64>> {
        if let Some(target) = self.target_return {
            self.check_target(model, target)?;
            let weights = self.min_variance_for_target(model, target, cuts)?;
            if let Some(max_vol) = self.max_volatility {
                let vol = model.portfolio_volatility(&weights);
                if vol > max_vol + VOLATILITY_TOLERANCE {
                    return Err(PlannerError::infeasible(
                        "max_volatility",
                        format!("target return {target} needs volatility {vol:.4}, above {max_vol}"),
                    ));
                }
            }
            return Ok(weights);
        }

        let weights = self.mean_variance(model, cuts)?;
        match self.max_volatility {
            Some(max_vol) if model.portfolio_volatility(&weights) > max_vol + VOLATILITY_TOLERANCE => {
                self.cap_volatility(model, max_vol, &weights, cuts)
            }
            _ => Ok(weights),
        }
    }

    /// Highest-return frontier portfolio whose volatility stays under `max_vol`.
    /// Frontier volatility increases with return above the minimum-variance
    /// point, so bisection on the target return finds it.
    fn cap_volatility(
        &self,
        model: &MarketModel,
        max_vol: f64,
        unconstrained: &DVector<f64>,
        cuts: &[LinearConstraint],
    ) -> PlannerResult<DVector<f64>> {
        let floor = self.min_variance(model, cuts)?;
        let floor_vol = model.portfolio_volatility(&floor);
        if floor_vol > max_vol + VOLATILITY_TOLERANCE {
            return Err(PlannerError::infeasible(
                "max_volatility",
                format!("lowest achievable volatility is {floor_vol:.4}, above {max_vol}"),
            ));
        }

        let mut lo = model.portfolio_return(&floor);
        let mut hi = model.portfolio_return(unconstrained);
        let mut best = floor;
        for _ in 0..BISECTION_STEPS {
            if hi - lo <= RETURN_TOLERANCE {
                break;
            }
            let mid = 0.5 * (lo + hi);
            let weights = self.min_variance_for_target(model, mid, cuts)?;
            if model.portfolio_volatility(&weights) <= max_vol + VOLATILITY_TOLERANCE {
                lo = mid;
                best = weights;
            } else {
                hi = mid;
            }
        }
        debug!(target = lo, max_vol, "volatility cap bound the allocation");
        Ok(best)
    }

    /// Box bounds and the budget alone already limit the reachable return;
    /// filling the best (worst) assets first gives those limits.
    fn check_target(&self, model: &MarketModel, target: f64) -> PlannerResult<()> {
        let (min, max) = self.return_range(model);
        if target > max + RETURN_TOLERANCE || target < min - RETURN_TOLERANCE {
            return Err(PlannerError::infeasible(
                "target_return",
                format!("target {target} outside the reachable range [{min:.4}, {max:.4}]"),
            ));
        }
        Ok(())
    }

    /// Lowest and highest portfolio return the box bounds and budget allow.
    pub(crate) fn return_range(&self, model: &MarketModel) -> (f64, f64) {
        let mu = &model.expected_returns;
        let mut order: Vec<usize> = (0..mu.len()).collect();
        order.sort_by(|a, b| mu[*b].partial_cmp(&mu[*a]).unwrap_or(std::cmp::Ordering::Equal));

        let fill = |order: &mut dyn Iterator<Item = &usize>| {
            let mut weights = self.lower.clone();
            let mut remaining = 1.0 - self.lower.sum();
            for &i in order {
                let add = (self.upper[i] - self.lower[i]).min(remaining).max(0.0);
                weights[i] += add;
                remaining -= add;
            }
            mu.dot(&weights)
        };
        let max = fill(&mut order.iter());
        let min = fill(&mut order.iter().rev());
        (min, max)
    }

    fn min_variance(&self, model: &MarketModel, cuts: &[LinearConstraint]) -> PlannerResult<DVector<f64>> {
        let n = self.symbols.len();
        self.run(model.covariance.clone(), DVector::zeros(n), self.constraints(cuts))
    }

    fn min_variance_for_target(
        &self,
        model: &MarketModel,
        target: f64,
        cuts: &[LinearConstraint],
    ) -> PlannerResult<DVector<f64>> {
        let n = self.symbols.len();
        let mut constraints = self.constraints(cuts);
        constraints.push(LinearConstraint::equality(
            model.expected_returns.clone(),
            target,
            "target_return",
        ));
        self.run(model.covariance.clone(), DVector::zeros(n), constraints)
    }

    /// max μᵀw − (δ/2) wᵀΣw
    fn mean_variance(&self, model: &MarketModel, cuts: &[LinearConstraint]) -> PlannerResult<DVector<f64>> {
        self.run(
            &model.covariance * self.risk_aversion,
            -&model.expected_returns,
            self.constraints(cuts),
        )
    }

    fn constraints(&self, cuts: &[LinearConstraint]) -> Vec<LinearConstraint> {
        let n = self.symbols.len();
        let mut out = Vec::with_capacity(2 * n + self.sector_caps.len() + cuts.len() + 2);
        out.push(LinearConstraint::equality(
            DVector::from_element(n, 1.0),
            1.0,
            "budget",
        ));
        for (i, symbol) in self.symbols.iter().enumerate() {
            let unit = DVector::from_fn(n, |j, _| if i == j { 1.0 } else { 0.0 });
            if self.upper[i] < 1.0 {
                out.push(LinearConstraint::at_most(
                    unit.clone(),
                    self.upper[i],
                    format!("max_weight[{symbol}]"),
                ));
            }
            out.push(LinearConstraint::at_least(
                unit,
                self.lower[i],
                format!("min_weight[{symbol}]"),
            ));
        }
        for cap in &self.sector_caps {
            out.push(LinearConstraint::at_most(
                cap.members.clone(),
                cap.cap,
                cap.name.clone(),
            ));
        }
        out.extend(cuts.iter().cloned());
        out
    }

    fn run(
        &self,
        hessian: DMatrix<f64>,
        linear: DVector<f64>,
        constraints: Vec<LinearConstraint>,
    ) -> PlannerResult<DVector<f64>> {
        let qp = QuadraticProgram {
            hessian,
            linear,
            constraints,
        };
        let solution = solve(&qp, self.max_iterations)?;
        // strip solver round-off outside the bounds
        Ok(DVector::from_fn(solution.x.len(), |i, _| {
            solution.x[i].clamp(self.lower[i], self.upper[i])
        }))
    }
}
