//! Black-Litterman blending of equilibrium returns with investor views.

use nalgebra::{DMatrix, DVector};
use planner_core::{Asset, MarketView, PlannerError, PlannerResult, ViewKind};
use tracing::debug;

use crate::covariance::MarketModel;

/// Floor on a view's variance so that fully confident views stay invertible.
const MIN_VIEW_VARIANCE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct BlackLittermanPosterior {
    pub equilibrium_returns: DVector<f64>,
    pub expected_returns: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Market-capitalisation weights; equal weights unless every asset has a
/// positive market cap.
pub fn market_weights(assets: &[Asset]) -> DVector<f64> {
    let n = assets.len();
    let caps: Option<Vec<f64>> = assets
        .iter()
        .map(|a| a.market_cap.filter(|c| *c > 0.0))
        .collect();
    match caps {
        Some(caps) => {
            let total: f64 = caps.iter().sum();
            DVector::from_fn(n, |i, _| caps[i] / total)
        }
        None => DVector::from_element(n, 1.0 / n as f64),
    }
}

/// Reverse optimisation: π = δ Σ w_mkt.
pub fn equilibrium_returns(
    covariance: &DMatrix<f64>,
    weights: &DVector<f64>,
    risk_aversion: f64,
) -> DVector<f64> {
    covariance * weights * risk_aversion
}

/// Pick matrix `P` (views × assets) and view returns `Q`.
fn view_matrices(symbols: &[String], views: &[MarketView]) -> PlannerResult<(DMatrix<f64>, DVector<f64>)> {
    let position = |symbol: &str, view: usize| {
        symbols.iter().position(|s| s == symbol).ok_or_else(|| {
            PlannerError::validation(
                format!("market_views[{view}]"),
                format!("references unknown asset {symbol}"),
            )
        })
    };
    let mut p = DMatrix::zeros(views.len(), symbols.len());
    for (k, view) in views.iter().enumerate() {
        match &view.kind {
            ViewKind::Absolute { symbol } => {
                p[(k, position(symbol, k)?)] = 1.0;
            }
            ViewKind::Relative {
                outperformer,
                underperformer,
            } => {
                p[(k, position(outperformer, k)?)] = 1.0;
                p[(k, position(underperformer, k)?)] = -1.0;
            }
        }
    }
    let q = DVector::from_iterator(views.len(), views.iter().map(|v| v.expected_return));
    Ok((p, q))
}

/// Posterior moments given the equilibrium prior and the views.
///
/// View variance follows the confidence-scaled prior variance of the view
/// portfolio, ω = τ·pΣpᵀ·(1 − c)/c. Without views the posterior mean is the
/// equilibrium and the covariance is Σ(1 + τ).
pub fn posterior(
    model: &MarketModel,
    assets: &[Asset],
    views: &[MarketView],
    tau: f64,
    risk_aversion: f64,
) -> PlannerResult<BlackLittermanPosterior> {
    let sigma = &model.covariance;
    let w_mkt = market_weights(assets);
    let pi = equilibrium_returns(sigma, &w_mkt, risk_aversion);
    let tau_sigma = sigma * tau;

    if views.is_empty() {
        return Ok(BlackLittermanPosterior {
            equilibrium_returns: pi.clone(),
            expected_returns: pi,
            covariance: sigma + &tau_sigma,
        });
    }

    let (p, q) = view_matrices(&model.symbols, views)?;
    let p_tau_sigma = &p * &tau_sigma;
    let view_prior = &p_tau_sigma * p.transpose();

    let omega = DMatrix::from_fn(views.len(), views.len(), |i, j| {
        if i != j {
            return 0.0;
        }
        let c = views[i].confidence;
        (view_prior[(i, i)] * (1.0 - c) / c).max(MIN_VIEW_VARIANCE)
    });

    let middle = (&view_prior + &omega).cholesky().ok_or_else(|| {
        PlannerError::validation(
            "market_views",
            "views are contradictory or degenerate (view covariance is singular)",
        )
    })?;
    let gain = &tau_sigma * p.transpose();

    let surprise = &q - &p * &pi;
    let expected_returns = &pi + &gain * middle.solve(&surprise);
    let update = &gain * middle.solve(&p_tau_sigma);
    let posterior_uncertainty = &tau_sigma - update;
    let covariance = sigma + posterior_uncertainty;
    let covariance = (&covariance + covariance.transpose()) * 0.5;

    debug!(views = views.len(), "black-litterman posterior computed");
    Ok(BlackLittermanPosterior {
        equilibrium_returns: pi,
        expected_returns,
        covariance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::estimate;
    use crate::models::OptimizerConfig;
    use approx::assert_relative_eq;

    fn setup() -> (Vec<Asset>, MarketModel) {
        let assets = vec![
            Asset::new("SPY", 0.08, 0.18).with_market_cap(600.0),
            Asset::new("AGG", 0.04, 0.06).with_market_cap(400.0),
        ];
        let corr = vec![vec![1.0, 0.2], vec![0.2, 1.0]];
        let model = estimate(&assets, Some(&corr), &OptimizerConfig::default()).unwrap();
        (assets, model)
    }

    #[test]
    fn test_equilibrium_is_reverse_optimised() {
        let (assets, model) = setup();
        let w = market_weights(&assets);
        assert_relative_eq!(w[0], 0.6);
        let pi = equilibrium_returns(&model.covariance, &w, 3.0);
        let expected = 3.0 * (0.0324 * 0.6 + 0.18 * 0.06 * 0.2 * 0.4);
        assert_relative_eq!(pi[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_caps_fall_back_to_equal_weights() {
        let assets = vec![
            Asset::new("A", 0.05, 0.1).with_market_cap(10.0),
            Asset::new("B", 0.05, 0.1),
        ];
        let w = market_weights(&assets);
        assert_relative_eq!(w[0], 0.5);
    }

    #[test]
    fn test_no_views_returns_equilibrium() {
        let (assets, model) = setup();
        let post = posterior(&model, &assets, &[], 0.025, 3.0).unwrap();
        assert_eq!(post.expected_returns, post.equilibrium_returns);
        assert_relative_eq!(post.covariance[(0, 0)], 0.0324 * 1.025, epsilon = 1e-12);
    }

    #[test]
    fn test_confident_view_pulls_posterior() {
        let (assets, model) = setup();
        let pi = posterior(&model, &assets, &[], 0.025, 3.0).unwrap().equilibrium_returns;

        let weak = posterior(&model, &assets, &[MarketView::absolute("SPY", 0.15, 0.1)], 0.025, 3.0).unwrap();
        let strong = posterior(&model, &assets, &[MarketView::absolute("SPY", 0.15, 0.9)], 0.025, 3.0).unwrap();
        let certain = posterior(&model, &assets, &[MarketView::absolute("SPY", 0.15, 1.0)], 0.025, 3.0).unwrap();

        assert!(weak.expected_returns[0] > pi[0]);
        assert!(strong.expected_returns[0] > weak.expected_returns[0]);
        assert_relative_eq!(certain.expected_returns[0], 0.15, epsilon = 1e-6);
        // positively correlated asset moves the same way
        assert!(strong.expected_returns[1] > pi[1]);
    }

    #[test]
    fn test_relative_view_widens_spread() {
        let (assets, model) = setup();
        let prior = posterior(&model, &assets, &[], 0.025, 3.0).unwrap();
        let post = posterior(
            &model,
            &assets,
            &[MarketView::relative("SPY", "AGG", 0.10, 0.8)],
            0.025,
            3.0,
        )
        .unwrap();
        let prior_spread = prior.expected_returns[0] - prior.expected_returns[1];
        let post_spread = post.expected_returns[0] - post.expected_returns[1];
        assert!(post_spread > prior_spread);
        assert!(post_spread < 0.10);
    }
}
