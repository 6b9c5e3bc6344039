use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;
use planner_core::{Allocation, Asset};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use stats_kernel::herfindahl_index;

use crate::covariance::MarketModel;
use crate::frontier::to_allocation;
use crate::models::{Diagnostics, RebalanceTrade, RebalancingPlan, TradeDirection};

/// Weight changes at or below 0.1% are not worth trading
pub const MIN_TRADE: f64 = 0.001;
const TAIL_CONFIDENCE: f64 = 0.95;
const UNCLASSIFIED: &str = "Unclassified";

/// Risk and concentration figures for a finished allocation. Fields that
/// depend on how the allocation was produced (Black-Litterman vectors,
/// resampling and CVaR counters) are left for the caller to fill in.
pub fn compute(model: &MarketModel, weights: &DVector<f64>, assets: &[Asset]) -> Diagnostics {
    let hhi = herfindahl_index(weights.as_slice());
    let vols = model.volatilities();
    let sigma_w = &model.covariance * weights;
    let variance = weights.dot(&sigma_w).max(0.0);
    let volatility = variance.sqrt();
    let expected_return = model.portfolio_return(weights);

    let diversification_ratio = if volatility > 1e-12 {
        weights.dot(&vols) / volatility
    } else {
        1.0
    };

    let risk_contributions = model
        .symbols
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let share = if variance > 1e-16 {
                weights[i] * sigma_w[i] / variance
            } else {
                weights[i]
            };
            (s.clone(), share)
        })
        .collect();

    let (value_at_risk_95, conditional_value_at_risk_95) = parametric_tail(expected_return, volatility);

    Diagnostics {
        diversification_score: if hhi > 0.0 { 1.0 / hhi } else { 0.0 },
        herfindahl_index: hhi,
        diversification_ratio,
        risk_contributions,
        value_at_risk_95,
        conditional_value_at_risk_95,
        sector_exposure: sector_exposure(assets, weights),
        equilibrium_returns: None,
        posterior_returns: None,
        resamples_used: None,
        cvar_cuts: None,
        covariance_corrected: model.corrected,
    }
}

/// One-year normal VaR and CVaR as loss fractions (negative means a gain
/// even in the tail).
fn parametric_tail(expected_return: f64, volatility: f64) -> (f64, f64) {
    let Ok(standard) = Normal::new(0.0, 1.0) else {
        return (0.0, 0.0);
    };
    let z = standard.inverse_cdf(TAIL_CONFIDENCE);
    let var = z * volatility - expected_return;
    let cvar = volatility * standard.pdf(z) / (1.0 - TAIL_CONFIDENCE) - expected_return;
    (var, cvar)
}

fn sector_exposure(assets: &[Asset], weights: &DVector<f64>) -> BTreeMap<String, f64> {
    let mut exposure = BTreeMap::new();
    for (asset, w) in assets.iter().zip(weights.iter()) {
        let sector = asset.sector.clone().unwrap_or_else(|| UNCLASSIFIED.to_string());
        *exposure.entry(sector).or_insert(0.0) += *w;
    }
    exposure
}

/// Returns per asset, for reporting Black-Litterman vectors.
pub fn by_symbol(model: &MarketModel, values: &DVector<f64>) -> BTreeMap<String, f64> {
    to_allocation(&model.symbols, values)
}

/// Trades that move `current` to `target`, skipping changes of 0.1% or less.
pub fn rebalancing_plan(target: &Allocation, current: &Allocation) -> RebalancingPlan {
    let symbols: BTreeSet<&String> = target.keys().chain(current.keys()).collect();
    let trades: Vec<RebalanceTrade> = symbols
        .into_iter()
        .filter_map(|symbol| {
            let difference = target.get(symbol).copied().unwrap_or(0.0)
                - current.get(symbol).copied().unwrap_or(0.0);
            (difference.abs() > MIN_TRADE).then(|| RebalanceTrade {
                symbol: symbol.clone(),
                direction: if difference > 0.0 {
                    TradeDirection::Buy
                } else {
                    TradeDirection::Sell
                },
                amount: difference.abs(),
            })
        })
        .collect();
    let total_turnover = trades.iter().map(|t| t.amount).sum();
    RebalancingPlan {
        trades,
        total_turnover,
    }
}
