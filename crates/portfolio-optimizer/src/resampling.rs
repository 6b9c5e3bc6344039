//! Michaud resampled efficiency: re-estimate the moments from simulated
//! histories, re-solve, and average the weights.

use nalgebra::{DMatrix, DVector};
use planner_core::{CancellationToken, PlannerError, PlannerResult};
use rayon::prelude::*;
use stats_kernel::linalg::sample_covariance_of_rows;
use stats_kernel::random::{standard_normal_vector, stream_rng};
use tracing::{debug, warn};

use crate::covariance::MarketModel;
use crate::cvar::ScenarioSet;
use crate::mean_variance::AllocationProblem;
use crate::models::OptimizerConfig;

const BATCH_SIZE: usize = 64;
const MIN_OBSERVATIONS: usize = 60;

#[derive(Debug, Clone)]
pub struct Resampled {
    pub weights: DVector<f64>,
    /// Draws that produced a feasible allocation
    pub used: usize,
}

/// Observations per simulated history: max(60, 2n), never fewer than n + 1
/// so the sample covariance has full rank.
pub fn observations(config: &OptimizerConfig, num_assets: usize) -> usize {
    config
        .resample_observations
        .unwrap_or_else(|| MIN_OBSERVATIONS.max(2 * num_assets))
        .max(num_assets + 1)
}

pub fn resample(
    problem: &AllocationProblem,
    model: &MarketModel,
    scenarios: Option<&ScenarioSet>,
    config: &OptimizerConfig,
    cancel: &CancellationToken,
) -> PlannerResult<Resampled> {
    let n = model.num_assets();
    let draws = config.num_resamples;
    let t = observations(config, n);
    let lower = model.sampling_factor()?;

    let run_draw = |draw: usize| -> PlannerResult<DVector<f64>> {
        let mut rng = stream_rng(config.seed, draw as u64);
        let mut history = DMatrix::zeros(t, n);
        for row in 0..t {
            let r = &model.expected_returns + &lower * standard_normal_vector(&mut rng, n);
            history.set_row(row, &r.transpose());
        }
        let (mu, cov) = sample_covariance_of_rows(&history)?;
        let resampled = model.with_moments(mu, cov);
        problem.solve(&resampled, scenarios).map(|a| a.weights)
    };

    let mut outcomes = Vec::with_capacity(draws);
    let mut start = 0;
    while start < draws {
        cancel.check()?;
        let end = (start + BATCH_SIZE).min(draws);
        let batch: Vec<PlannerResult<DVector<f64>>> = (start..end).into_par_iter().map(&run_draw).collect();
        outcomes.extend(batch);
        start = end;
    }
    cancel.check()?;

    // summed in draw order so the average does not depend on scheduling
    let mut total = DVector::zeros(n);
    let mut used = 0;
    let mut first_error: Option<PlannerError> = None;
    for (draw, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(weights) => {
                total += weights;
                used += 1;
            }
            Err(e) => {
                debug!(draw, error = %e, "resample draw skipped");
                first_error.get_or_insert(e);
            }
        }
    }

    if used == 0 {
        return Err(first_error.unwrap_or_else(|| {
            PlannerError::InsufficientData("no resampling draws were run".to_string())
        }));
    }
    if used < draws {
        warn!(used, draws, "some resampling draws were infeasible and skipped");
    }

    // each draw sums to one and respects the bounds, so the mean does too
    Ok(Resampled {
        weights: total / used as f64,
        used,
    })
}
