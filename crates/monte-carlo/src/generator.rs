use nalgebra::{DMatrix, DVector};
use planner_core::validation::{ensure_non_negative, ensure_rate};
use planner_core::{PlannerError, PlannerResult};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stats_kernel::linalg::{cholesky_with_fallback, from_rows, validate_correlation};
use stats_kernel::random::{standard_normal_vector, stream_rng};
use tracing::debug;

/// Annual return assumption for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAssumption {
    pub symbol: String,
    pub expected_return: f64,
    pub volatility: f64,
}

/// Per-asset annual assumptions plus their correlation matrix, row order
/// matching `assets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnAssumptions {
    pub assets: Vec<AssetAssumption>,
    pub correlation: Vec<Vec<f64>>,
}

impl ReturnAssumptions {
    pub fn symbols(&self) -> Vec<&str> {
        self.assets.iter().map(|a| a.symbol.as_str()).collect()
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.assets.is_empty() {
            return Err(PlannerError::InsufficientData(
                "return assumptions list no assets".to_string(),
            ));
        }
        for (i, asset) in self.assets.iter().enumerate() {
            if self.assets[..i].iter().any(|a| a.symbol == asset.symbol) {
                return Err(PlannerError::validation(
                    format!("return_assumptions.assets[{i}].symbol"),
                    format!("duplicate symbol {}", asset.symbol),
                ));
            }
            ensure_rate(
                asset.expected_return,
                &format!("return_assumptions.assets[{i}].expected_return"),
            )?;
            ensure_non_negative(
                asset.volatility,
                &format!("return_assumptions.assets[{i}].volatility"),
            )?;
        }
        let corr = from_rows(&self.correlation, "return_assumptions.correlation")?;
        if corr.nrows() != self.assets.len() {
            return Err(PlannerError::validation(
                "return_assumptions.correlation",
                format!(
                    "expected {n}x{n} matrix for {n} assets, got {m}x{m}",
                    n = self.assets.len(),
                    m = corr.nrows()
                ),
            ));
        }
        validate_correlation(&corr, "return_assumptions.correlation")
    }
}

/// Annual expected return to the equivalent compounded monthly rate.
pub fn monthly_mean(annual: f64) -> f64 {
    (1.0 + annual).powf(1.0 / 12.0) - 1.0
}

pub fn monthly_volatility(annual: f64) -> f64 {
    annual / 12.0_f64.sqrt()
}

/// Joint-normal monthly return draws with a fixed correlation structure.
///
/// Each draw is `mean + vol ⊙ (L · z)` with `z ~ N(0, I)` and `L` the
/// Cholesky factor of the correlation matrix, so the monthly covariance is
/// `diag(vol) · ρ · diag(vol)`.
#[derive(Debug, Clone)]
pub struct CorrelatedReturnGenerator {
    monthly_means: DVector<f64>,
    monthly_vols: DVector<f64>,
    lower: DMatrix<f64>,
    corrected: bool,
}

impl CorrelatedReturnGenerator {
    pub fn new(assumptions: &ReturnAssumptions) -> PlannerResult<Self> {
        assumptions.validate()?;
        let corr = from_rows(&assumptions.correlation, "return_assumptions.correlation")?;
        let factor = cholesky_with_fallback(&corr, "return_assumptions.correlation")?;
        let n = assumptions.assets.len();
        let monthly_means =
            DVector::from_fn(n, |i, _| monthly_mean(assumptions.assets[i].expected_return));
        let monthly_vols =
            DVector::from_fn(n, |i, _| monthly_volatility(assumptions.assets[i].volatility));
        debug!(assets = n, corrected = factor.corrected, "return generator ready");
        Ok(Self {
            monthly_means,
            monthly_vols,
            lower: factor.lower,
            corrected: factor.corrected,
        })
    }

    pub fn num_assets(&self) -> usize {
        self.monthly_means.len()
    }

    /// Whether the correlation matrix had to be replaced by its nearest PSD matrix.
    pub fn corrected(&self) -> bool {
        self.corrected
    }

    pub fn monthly_means(&self) -> &DVector<f64> {
        &self.monthly_means
    }

    /// One month of correlated asset returns.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z = standard_normal_vector(rng, self.num_assets());
        let correlated = &self.lower * z;
        &self.monthly_means + self.monthly_vols.component_mul(&correlated)
    }

    /// `months` consecutive draws for trial `trial` of a run seeded with `seed`.
    pub fn trial_returns(&self, seed: u64, trial: u64, months: usize) -> Vec<DVector<f64>> {
        let mut rng = stream_rng(seed, trial);
        (0..months).map(|_| self.sample(&mut rng)).collect()
    }

    /// Full return tensor indexed `[trial][month][asset]`.
    pub fn generate(&self, trials: usize, months: usize, seed: u64) -> Vec<Vec<Vec<f64>>> {
        (0..trials)
            .into_par_iter()
            .map(|trial| {
                self.trial_returns(seed, trial as u64, months)
                    .into_iter()
                    .map(|r| r.iter().copied().collect())
                    .collect()
            })
            .collect()
    }
}
