//! Sample statistics over plain `f64` slices.
//! Stateless functions shared by the simulator and both optimizers.

use planner_core::{PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

const RANK_EPSILON: f64 = 1e-9;

fn require_samples(samples: &[f64], what: &str) -> PlannerResult<()> {
    if samples.is_empty() {
        return Err(PlannerError::InsufficientData(format!(
            "{what} needs at least one sample"
        )));
    }
    Ok(())
}

/// Ascending copy of the samples.
pub fn sorted(samples: &[f64]) -> Vec<f64> {
    let mut out = samples.to_vec();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out
}

pub fn mean(samples: &[f64]) -> PlannerResult<f64> {
    require_samples(samples, "mean")?;
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population standard deviation (divide by N). Zero for a single sample.
pub fn population_std(samples: &[f64]) -> PlannerResult<f64> {
    let m = mean(samples)?;
    let n = samples.len() as f64;
    let var = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n;
    Ok(var.sqrt())
}

/// Sample standard deviation (divide by N-1). Zero for a single sample.
pub fn sample_std(samples: &[f64]) -> PlannerResult<f64> {
    let m = mean(samples)?;
    if samples.len() < 2 {
        return Ok(0.0);
    }
    let n = samples.len() as f64;
    let var = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1.0);
    Ok(var.sqrt())
}

/// Nearest-rank percentile of an already sorted slice, `p` in [0, 1].
///
/// The rank is `ceil(p * N)` clamped to `[1, N]`, so `p = 0` yields the
/// minimum and `p = 1` the maximum.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> PlannerResult<f64> {
    require_samples(sorted, "percentile")?;
    planner_core::validation::ensure_probability(p, "percentile")?;
    let n = sorted.len();
    // absorb representation noise such as 0.95 * 100 = 95.00000000000001
    let rank = (p * n as f64 - RANK_EPSILON).ceil().max(0.0) as usize;
    Ok(sorted[rank.clamp(1, n) - 1])
}

pub fn percentile(samples: &[f64], p: f64) -> PlannerResult<f64> {
    percentile_sorted(&sorted(samples), p)
}

pub fn median(samples: &[f64]) -> PlannerResult<f64> {
    percentile(samples, 0.5)
}

/// Value-at-Risk of an outcome distribution: the `alpha`-quantile of the
/// outcome values (e.g. the 5th percentile of terminal wealth for 0.05).
pub fn value_at_risk(samples: &[f64], alpha: f64) -> PlannerResult<f64> {
    planner_core::validation::ensure_open_unit(alpha, "alpha")?;
    percentile(samples, alpha)
}

/// Expected shortfall: mean of all outcomes at or below the VaR threshold.
pub fn conditional_value_at_risk(samples: &[f64], alpha: f64) -> PlannerResult<f64> {
    planner_core::validation::ensure_open_unit(alpha, "alpha")?;
    let sorted = sorted(samples);
    let threshold = percentile_sorted(&sorted, alpha)?;
    let tail: Vec<f64> = sorted.iter().copied().take_while(|v| *v <= threshold).collect();
    mean(&tail)
}

/// Largest peak-to-trough decline as a fraction of the peak, in [0, 1].
///
/// One pass tracking the running peak. Non-positive peaks contribute no
/// drawdown.
pub fn max_drawdown(path: &[f64]) -> PlannerResult<f64> {
    require_samples(path, "max drawdown")?;
    let mut peak = path[0];
    let mut max_dd = 0.0_f64;
    for &v in path {
        if v > peak {
            peak = v;
        }
        if peak > 0.0 {
            let dd = ((peak - v) / peak).clamp(0.0, 1.0);
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    Ok(max_dd)
}

/// Sum of squared weights. 1.0 for a single holding, 1/N for equal weights.
pub fn herfindahl_index(weights: &[f64]) -> f64 {
    weights.iter().map(|w| w * w).sum()
}

/// Population skewness. Zero when the samples have no dispersion.
pub fn skewness(samples: &[f64]) -> PlannerResult<f64> {
    let m = mean(samples)?;
    let sd = population_std(samples)?;
    if sd < 1e-12 {
        return Ok(0.0);
    }
    let n = samples.len() as f64;
    Ok(samples.iter().map(|x| ((x - m) / sd).powi(3)).sum::<f64>() / n)
}

/// Population excess kurtosis (normal = 0).
pub fn excess_kurtosis(samples: &[f64]) -> PlannerResult<f64> {
    let m = mean(samples)?;
    let sd = population_std(samples)?;
    if sd < 1e-12 {
        return Ok(0.0);
    }
    let n = samples.len() as f64;
    Ok(samples.iter().map(|x| ((x - m) / sd).powi(4)).sum::<f64>() / n - 3.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JarqueBera {
    pub statistic: f64,
    pub p_value: f64,
    /// True when normality is rejected at the 5% level
    pub reject_normal: bool,
}

/// Jarque-Bera normality test, JB = n/6 (S² + K²/4) against χ²(2).
pub fn jarque_bera(samples: &[f64]) -> PlannerResult<JarqueBera> {
    let s = skewness(samples)?;
    let k = excess_kurtosis(samples)?;
    let n = samples.len() as f64;
    let statistic = n / 6.0 * (s * s + k * k / 4.0);
    let p_value = ChiSquared::new(2.0)
        .map(|chi| 1.0 - chi.cdf(statistic))
        .unwrap_or_else(|_| (-statistic / 2.0).exp());
    Ok(JarqueBera {
        statistic,
        p_value,
        reject_normal: p_value < 0.05,
    })
}

/// Annualised Sharpe ratio of a periodic return series.
/// `None` for fewer than 3 observations or zero dispersion.
pub fn sharpe_ratio(returns: &[f64], rf_annual: f64, periods_per_year: f64) -> Option<f64> {
    if returns.len() < 3 {
        return None;
    }
    let rf = rf_annual / periods_per_year;
    let m = mean(returns).ok()?;
    let sd = sample_std(returns).ok()?;
    if sd < 1e-12 {
        return None;
    }
    Some((m - rf) / sd * periods_per_year.sqrt())
}

/// Annualised Sortino ratio; only returns below the risk-free rate count as risk.
pub fn sortino_ratio(returns: &[f64], rf_annual: f64, periods_per_year: f64) -> Option<f64> {
    if returns.len() < 3 {
        return None;
    }
    let rf = rf_annual / periods_per_year;
    let m = mean(returns).ok()?;
    let n = returns.len() as f64;
    let downside = returns
        .iter()
        .filter(|&&r| r < rf)
        .map(|r| (r - rf).powi(2))
        .sum::<f64>();
    let downside_dev = (downside / (n - 1.0)).sqrt();
    if downside_dev < 1e-12 {
        return None;
    }
    Some((m - rf) / downside_dev * periods_per_year.sqrt())
}

fn require_aligned(a: &[f64], b: &[f64], what: &str) -> PlannerResult<()> {
    if a.len() != b.len() {
        return Err(PlannerError::InsufficientData(format!(
            "{what} needs aligned series, got lengths {} and {}",
            a.len(),
            b.len()
        )));
    }
    if a.len() < 2 {
        return Err(PlannerError::InsufficientData(format!(
            "{what} needs at least two observations"
        )));
    }
    Ok(())
}

/// Pearson correlation of two aligned series. Zero if either is constant.
pub fn correlation(a: &[f64], b: &[f64]) -> PlannerResult<f64> {
    require_aligned(a, b, "correlation")?;
    let ma = mean(a)?;
    let mb = mean(b)?;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - ma;
        let dy = y - mb;
        cov += dx * dy;
        va += dx * dx;
        vb += dy * dy;
    }
    if va < 1e-18 || vb < 1e-18 {
        return Ok(0.0);
    }
    Ok((cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0))
}

/// Annualised standard deviation of the return difference `a - b`.
pub fn tracking_error(a: &[f64], b: &[f64], periods_per_year: f64) -> PlannerResult<f64> {
    require_aligned(a, b, "tracking error")?;
    let diffs: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    Ok(sample_std(&diffs)? * periods_per_year.sqrt())
}

/// Two-sided band holding `level` of the mass: percentiles
/// `(1 - level) / 2` and `1 - (1 - level) / 2`.
pub fn confidence_band_sorted(sorted: &[f64], level: f64) -> PlannerResult<(f64, f64)> {
    planner_core::validation::ensure_open_unit(level, "confidence level")?;
    let tail = (1.0 - level) / 2.0;
    Ok((
        percentile_sorted(sorted, tail)?,
        percentile_sorted(sorted, 1.0 - tail)?,
    ))
}

pub fn confidence_band(samples: &[f64], level: f64) -> PlannerResult<(f64, f64)> {
    confidence_band_sorted(&sorted(samples), level)
}

/// Location and dispersion of a sample set in one pass over a sorted copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

pub fn summarize(samples: &[f64]) -> PlannerResult<Summary> {
    let sorted = sorted(samples);
    Ok(Summary {
        count: sorted.len(),
        mean: mean(&sorted)?,
        median: percentile_sorted(&sorted, 0.5)?,
        std_dev: population_std(&sorted)?,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    })
}
