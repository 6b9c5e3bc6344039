//! Scenario-based CVaR budget, enforced with cutting planes.
//!
//! CVaR at tail probability α is the mean loss over the worst `k = ⌈αS⌉`
//! of `S` scenarios. For any fixed set of `k` scenarios the mean loss is
//! linear in the weights, and CVaR is the maximum over all such sets, so
//! `CVaR(w) <= budget` is the intersection of one linear constraint per set.
//! Only the sets that are actually the worst at some iterate get added.

use nalgebra::{DMatrix, DVector};
use planner_core::{PlannerError, PlannerResult};
use stats_kernel::random::{standard_normal_vector, stream_rng};

use crate::covariance::MarketModel;
use crate::qp::LinearConstraint;

pub const MAX_CUTS: usize = 50;
pub const CUT_NAME: &str = "cvar_budget";

/// Scenario returns, one row per scenario, one column per asset.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    pub returns: DMatrix<f64>,
}

impl ScenarioSet {
    pub fn from_history(series: &[Vec<f64>]) -> PlannerResult<Self> {
        let n = series.len();
        let t = series.first().map(|s| s.len()).unwrap_or(0);
        if n == 0 || t == 0 {
            return Err(PlannerError::InsufficientData("no scenario history".to_string()));
        }
        Ok(Self {
            returns: DMatrix::from_fn(t, n, |s, i| series[i][s]),
        })
    }

    /// `count` joint-normal draws from the model's annual moments.
    pub fn simulate(model: &MarketModel, count: usize, seed: u64) -> PlannerResult<Self> {
        let n = model.num_assets();
        let lower = model.sampling_factor()?;
        let mut rng = stream_rng(seed, u64::MAX);
        let mut returns = DMatrix::zeros(count, n);
        for s in 0..count {
            let draw = &model.expected_returns + &lower * standard_normal_vector(&mut rng, n);
            returns.set_row(s, &draw.transpose());
        }
        Ok(Self { returns })
    }

    pub fn len(&self) -> usize {
        self.returns.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.nrows() == 0
    }

    fn tail_size(&self, alpha: f64) -> usize {
        ((alpha * self.len() as f64).ceil() as usize).clamp(1, self.len())
    }

    /// Portfolio CVaR (positive = loss) and the scenarios in the tail.
    pub fn cvar(&self, weights: &DVector<f64>, alpha: f64) -> (f64, Vec<usize>) {
        let losses = -(&self.returns * weights);
        let mut order: Vec<usize> = (0..losses.len()).collect();
        order.sort_by(|a, b| {
            losses[*b]
                .partial_cmp(&losses[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let k = self.tail_size(alpha);
        order.truncate(k);
        let cvar = order.iter().map(|&s| losses[s]).sum::<f64>() / k as f64;
        (cvar, order)
    }

    /// Mean tail loss of `tail` kept at or below `max_cvar`.
    pub fn cut(&self, tail: &[usize], max_cvar: f64) -> LinearConstraint {
        let n = self.returns.ncols();
        let mut normal = DVector::zeros(n);
        for &s in tail {
            normal += self.returns.row(s).transpose();
        }
        normal /= tail.len() as f64;
        LinearConstraint::at_least(normal, -max_cvar, CUT_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scenarios() -> ScenarioSet {
        ScenarioSet::from_history(&[
            vec![0.10, -0.20, 0.05, -0.05],
            vec![0.02, 0.01, 0.03, 0.00],
        ])
        .unwrap()
    }

    #[test]
    fn test_cvar_of_worst_tail() {
        let set = scenarios();
        let w = DVector::from_vec(vec![1.0, 0.0]);
        let (cvar, tail) = set.cvar(&w, 0.5);
        assert_eq!(tail, vec![1, 3]);
        assert_relative_eq!(cvar, 0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_cut_matches_cvar_at_iterate() {
        let set = scenarios();
        let w = DVector::from_vec(vec![0.5, 0.5]);
        let (cvar, tail) = set.cvar(&w, 0.25);
        let cut = set.cut(&tail, 0.0);
        // normalᵀw = -(mean tail loss)
        assert_relative_eq!(cut.normal.dot(&w), -cvar, epsilon = 1e-12);
    }
}
