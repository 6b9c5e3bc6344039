use nalgebra::{DMatrix, DVector};
use planner_core::{Asset, PlannerError, PlannerResult};
use stats_kernel::linalg::{
    cholesky_with_fallback, covariance_from_correlation, from_rows, sample_covariance,
    shrink_to_diagonal, validate_correlation,
};
use tracing::{debug, warn};

use crate::models::{CovarianceSource, OptimizerConfig};

/// Annualised expected returns and covariance in asset order.
#[derive(Debug, Clone)]
pub struct MarketModel {
    pub symbols: Vec<String>,
    pub expected_returns: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Covariance had to be replaced by its nearest PSD matrix
    pub corrected: bool,
}

impl MarketModel {
    pub fn num_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn volatilities(&self) -> DVector<f64> {
        self.covariance.diagonal().map(|v| v.max(0.0).sqrt())
    }

    pub fn portfolio_return(&self, weights: &DVector<f64>) -> f64 {
        self.expected_returns.dot(weights)
    }

    pub fn portfolio_volatility(&self, weights: &DVector<f64>) -> f64 {
        (weights.dot(&(&self.covariance * weights))).max(0.0).sqrt()
    }

    /// Lower factor `L` with `LLᵀ = Σ`; zero-variance assets get zero rows.
    pub fn sampling_factor(&self) -> PlannerResult<DMatrix<f64>> {
        let n = self.num_assets();
        let (active, sub) = active_block(&self.covariance);
        if active.is_empty() {
            return Ok(DMatrix::zeros(n, n));
        }
        let factor = cholesky_with_fallback(&sub, "covariance")?;
        Ok(embed(&factor.lower, &active, n))
    }

    /// New moments (after a Black-Litterman blend or a resampling draw) (after a Black-Litterman blend).
    pub fn with_moments(&self, expected_returns: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self {
            symbols: self.symbols.clone(),
            expected_returns,
            covariance,
            corrected: self.corrected,
        }
    }
}

/// Historical series for every asset, equal length, or `None`.
pub fn aligned_history(assets: &[Asset]) -> Option<Vec<Vec<f64>>> {
    let series: Vec<Vec<f64>> = assets
        .iter()
        .map(|a| a.historical_returns.clone())
        .collect::<Option<Vec<_>>>()?;
    let len = series.first()?.len();
    if len < 2 || series.iter().any(|s| s.len() != len) {
        return None;
    }
    Some(series)
}

/// Build the return/risk model the optimiser works on.
///
/// With [`CovarianceSource::Historical`] both moments come from the assets'
/// return histories, annualised by `periods_per_year`. Otherwise expected
/// returns and volatilities are taken as given and combined with the
/// correlation matrix (identity when none is supplied).
pub fn estimate(
    assets: &[Asset],
    correlation: Option<&[Vec<f64>]>,
    config: &OptimizerConfig,
) -> PlannerResult<MarketModel> {
    let n = assets.len();
    let symbols: Vec<String> = assets.iter().map(|a| a.symbol.clone()).collect();

    let (expected_returns, raw) = match config.covariance_source {
        CovarianceSource::Historical => {
            let series = aligned_history(assets).ok_or_else(|| {
                PlannerError::InsufficientData(
                    "historical covariance needs equal-length return histories (>= 2 periods) for every asset"
                        .to_string(),
                )
            })?;
            let ppy = config.periods_per_year;
            let mu = DVector::from_fn(n, |i, _| {
                series[i].iter().sum::<f64>() / series[i].len() as f64 * ppy
            });
            (mu, sample_covariance(&series)? * ppy)
        }
        CovarianceSource::Assumed => {
            let corr = match correlation {
                Some(rows) => {
                    let m = from_rows(rows, "correlation")?;
                    if m.nrows() != n {
                        return Err(PlannerError::validation(
                            "correlation",
                            format!("expected {n}x{n} matrix for {n} assets, got {0}x{0}", m.nrows()),
                        ));
                    }
                    validate_correlation(&m, "correlation")?;
                    m
                }
                None => {
                    warn!(assets = n, "no correlation matrix supplied, assuming uncorrelated assets");
                    DMatrix::identity(n, n)
                }
            };
            let vols: Vec<f64> = assets.iter().map(|a| a.volatility).collect();
            let mu = DVector::from_fn(n, |i, _| assets[i].expected_return);
            (mu, covariance_from_correlation(&vols, &corr)?)
        }
    };

    let shrunk = if config.shrinkage > 0.0 {
        shrink_to_diagonal(&raw, config.shrinkage)
    } else {
        raw
    };

    let (covariance, corrected) = ensure_psd(shrunk)?;
    debug!(assets = n, corrected, "market model estimated");
    Ok(MarketModel {
        symbols,
        expected_returns,
        covariance,
        corrected,
    })
}

/// Indices of the positive-variance assets and their covariance block.
fn active_block(cov: &DMatrix<f64>) -> (Vec<usize>, DMatrix<f64>) {
    let active: Vec<usize> = (0..cov.nrows()).filter(|&i| cov[(i, i)] > 0.0).collect();
    let sub = DMatrix::from_fn(active.len(), active.len(), |i, j| cov[(active[i], active[j])]);
    (active, sub)
}

fn embed(block: &DMatrix<f64>, active: &[usize], n: usize) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(n, n);
    for (a, &i) in active.iter().enumerate() {
        for (b, &j) in active.iter().enumerate() {
            out[(i, j)] = block[(a, b)];
        }
    }
    out
}

/// Covariance that admits a Cholesky factor. Zero-variance rows are left
/// alone; only the indefinite case is rebuilt from the corrected factor.
fn ensure_psd(cov: DMatrix<f64>) -> PlannerResult<(DMatrix<f64>, bool)> {
    let (active, sub) = active_block(&cov);
    if active.is_empty() {
        return Ok((cov, false));
    }
    let factor = cholesky_with_fallback(&sub, "covariance")?;
    if !factor.corrected {
        return Ok((cov, false));
    }
    let repaired = &factor.lower * factor.lower.transpose();
    Ok((embed(&repaired, &active, cov.nrows()), true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assets() -> Vec<Asset> {
        vec![Asset::new("SPY", 0.08, 0.18), Asset::new("AGG", 0.04, 0.06)]
    }

    #[test]
    fn test_assumed_covariance() {
        let corr = vec![vec![1.0, -0.1], vec![-0.1, 1.0]];
        let model = estimate(&assets(), Some(&corr), &OptimizerConfig::default()).unwrap();
        assert_relative_eq!(model.covariance[(0, 0)], 0.0324, epsilon = 1e-12);
        assert_relative_eq!(model.covariance[(1, 0)], -0.00108, epsilon = 1e-12);
        assert!(!model.corrected);
    }

    #[test]
    fn test_missing_correlation_means_uncorrelated() {
        let model = estimate(&assets(), None, &OptimizerConfig::default()).unwrap();
        assert_eq!(model.covariance[(0, 1)], 0.0);
    }

    #[test]
    fn test_historical_moments_are_annualised() {
        let a = vec![0.01, 0.02, -0.01, 0.03];
        let b = vec![0.0, 0.005, 0.01, 0.005];
        let assets = vec![
            Asset::new("A", 0.0, 0.0).with_history(a.clone()),
            Asset::new("B", 0.0, 0.0).with_history(b.clone()),
        ];
        let config = OptimizerConfig {
            covariance_source: CovarianceSource::Historical,
            ..Default::default()
        };
        let model = estimate(&assets, None, &config).unwrap();
        assert_relative_eq!(model.expected_returns[0], 0.0125 * 12.0, epsilon = 1e-12);
        let raw = sample_covariance(&[a, b]).unwrap();
        assert_relative_eq!(model.covariance[(0, 1)], raw[(0, 1)] * 12.0, epsilon = 1e-12);
    }

    #[test]
    fn test_historical_without_series_fails() {
        let config = OptimizerConfig {
            covariance_source: CovarianceSource::Historical,
            ..Default::default()
        };
        assert!(matches!(
            estimate(&assets(), None, &config),
            Err(PlannerError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_zero_volatility_asset_is_kept() {
        let assets = vec![Asset::new("SPY", 0.08, 0.18), Asset::new("CASH", 0.02, 0.0)];
        let model = estimate(&assets, None, &OptimizerConfig::default()).unwrap();
        assert_eq!(model.covariance[(1, 1)], 0.0);
        assert!(!model.corrected);

        let l = model.sampling_factor().unwrap();
        assert_relative_eq!(l[(0, 0)], 0.18, epsilon = 1e-12);
        assert_eq!(l.row(1).sum(), 0.0);
    }
}
