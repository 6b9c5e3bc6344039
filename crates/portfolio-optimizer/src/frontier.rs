use nalgebra::DVector;
use planner_core::{Allocation, CancellationToken, PlannerError, PlannerResult};
use rayon::prelude::*;
use tracing::debug;

use crate::covariance::MarketModel;
use crate::cvar::ScenarioSet;
use crate::mean_variance::AllocationProblem;
use crate::models::FrontierPoint;

pub const DEFAULT_POINTS: usize = 50;

/// Evenly spaced targets across the returns the weight bounds can reach.
pub fn target_returns(
    problem: &AllocationProblem,
    model: &MarketModel,
    num_points: usize,
) -> PlannerResult<Vec<f64>> {
    if num_points < 2 {
        return Err(PlannerError::validation("num_points", "must be >= 2"));
    }
    let (lo, hi) = problem.return_range(model);
    let step = (hi - lo) / (num_points - 1) as f64;
    Ok((0..num_points).map(|i| lo + step * i as f64).collect())
}

/// Minimum-variance portfolio at each target; targets that sector caps or
/// a CVaR budget make unreachable are left out. Points come back in increasing return order.
pub fn trace(
    problem: &AllocationProblem,
    model: &MarketModel,
    scenarios: Option<&ScenarioSet>,
    num_points: usize,
    risk_free_rate: f64,
    cancel: &CancellationToken,
) -> PlannerResult<Vec<FrontierPoint>> {
    let targets = target_returns(problem, model, num_points)?;
    cancel.check()?;

    let solved: Vec<(f64, PlannerResult<DVector<f64>>)> = targets
        .par_iter()
        .map(|&target| {
            let outcome = problem
                .with_target(target)
                .solve(model, scenarios)
                .map(|a| a.weights);
            (target, outcome)
        })
        .collect();
    cancel.check()?;

    let mut points = Vec::with_capacity(solved.len());
    let mut first_error = None;
    for (target, outcome) in solved {
        match outcome {
            Ok(weights) => points.push(point(model, &weights, risk_free_rate)),
            Err(e) => {
                debug!(target, error = %e, "frontier point skipped");
                first_error.get_or_insert(e);
            }
        }
    }

    if points.is_empty() {
        return Err(first_error.unwrap_or_else(|| {
            PlannerError::InsufficientData("no frontier points".to_string())
        }));
    }
    debug!(points = points.len(), requested = num_points, "frontier traced");
    Ok(points)
}

fn point(model: &MarketModel, weights: &DVector<f64>, risk_free_rate: f64) -> FrontierPoint {
    let expected_return = model.portfolio_return(weights);
    let risk = model.portfolio_volatility(weights);
    FrontierPoint {
        risk,
        expected_return,
        weights: to_allocation(&model.symbols, weights),
        sharpe_ratio: sharpe(expected_return, risk, risk_free_rate),
    }
}

pub fn sharpe(expected_return: f64, volatility: f64, risk_free_rate: f64) -> f64 {
    if volatility > 1e-12 {
        (expected_return - risk_free_rate) / volatility
    } else {
        0.0
    }
}

pub fn to_allocation(symbols: &[String], weights: &DVector<f64>) -> Allocation {
    symbols
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| (s.clone(), *w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OptimizationConstraints, OptimizerConfig};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use planner_core::Asset;

    fn model() -> MarketModel {
        MarketModel {
            symbols: vec!["A".into(), "B".into()],
            expected_returns: DVector::from_vec(vec![0.10, 0.05]),
            covariance: DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.01]),
            corrected: false,
        }
    }

    fn problem(constraints: OptimizationConstraints) -> AllocationProblem {
        let assets = vec![Asset::new("A", 0.10, 0.20), Asset::new("B", 0.05, 0.10)];
        AllocationProblem::new(&assets, &constraints, &OptimizerConfig::default()).unwrap()
    }

    #[test]
    fn test_targets_span_asset_returns() {
        let problem = problem(OptimizationConstraints::default());
        let targets = target_returns(&problem, &model(), 11).unwrap();
        assert_eq!(targets.len(), 11);
        assert_relative_eq!(targets[0], 0.05, epsilon = 1e-12);
        assert_relative_eq!(targets[10], 0.10, epsilon = 1e-12);
        assert!(target_returns(&problem, &model(), 1).is_err());
    }

    #[test]
    fn test_frontier_is_ordered() {
        let points = trace(
            &problem(OptimizationConstraints::default()),
            &model(),
            None,
            20,
            0.02,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(points.len(), 20);
        for pair in points.windows(2) {
            assert!(pair[1].expected_return > pair[0].expected_return);
        }
        // above the minimum-variance point risk grows with return
        let min_var = points
            .iter()
            .position(|p| p.expected_return >= 0.06 - 1e-9)
            .unwrap();
        for pair in points[min_var..].windows(2) {
            assert!(pair[1].risk >= pair[0].risk - 1e-9);
        }
        for p in &points {
            assert_relative_eq!(p.weights.values().sum::<f64>(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_targets_stay_within_weight_bounds() {
        let mut constraints = OptimizationConstraints::default();
        constraints.max_weights.insert("A".to_string(), 0.5);
        let points = trace(&problem(constraints), &model(), None, 11, 0.02, &CancellationToken::new()).unwrap();
        // returns above 0.075 need more than half in A
        assert_eq!(points.len(), 11);
        assert_relative_eq!(points[0].expected_return, 0.05, epsilon = 1e-6);
        assert_relative_eq!(points[10].expected_return, 0.075, epsilon = 1e-6);
    }
}
