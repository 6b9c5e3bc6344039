use planner_core::PlannerResult;
use tracing::{info, info_span};

use crate::asset_location::{optimize_location, AssetLocation};
use crate::harvester::{HarvestScan, HarvestingEngine};
use crate::models::{ProjectedSavings, TaxConfig, TaxEfficiency, TaxPortfolio, TaxStrategy};
use crate::substitutes::SubstituteFinder;
use crate::tax_calculator::{TaxCalculator, TaxRates};
use crate::withdrawal::{least_efficient_tax_cost, plan_withdrawals, WithdrawalPlan};

pub const LOCATION_WEIGHT: f64 = 0.4;
pub const HARVESTING_WEIGHT: f64 = 0.3;
pub const WITHDRAWAL_WEIGHT: f64 = 0.3;

/// Asset location, loss harvesting and withdrawal sequencing for one
/// portfolio snapshot, with the combined efficiency score and projected
/// savings. Deterministic for identical inputs.
pub fn compute_tax_strategy(
    portfolio: &TaxPortfolio,
    rates: &TaxRates,
    config: &TaxConfig,
) -> PlannerResult<TaxStrategy> {
    config.validate()?;
    rates.validate()?;
    portfolio.validate()?;
    let as_of = config.evaluation_date()?;

    let span = info_span!(
        "compute_tax_strategy",
        assets = portfolio.assets.len(),
        lots = portfolio.lots.len(),
        %as_of
    );
    let _guard = span.enter();

    let accounts = portfolio.effective_accounts();
    let asset_location = optimize_location(&portfolio.assets, &accounts, &config.location_scores)?;

    let engine = HarvestingEngine::new(
        TaxCalculator::new(*rates, config.rules),
        SubstituteFinder::new(config.substitutes),
        config.harvesting.clone(),
    );
    let HarvestScan {
        opportunities,
        summary,
    } = engine.find_opportunities(portfolio, as_of);

    let withdrawal_strategy = plan_withdrawals(&accounts, portfolio.withdrawal_needs, rates, &config.withdrawal)?;

    let efficiency = efficiency_score(asset_location.score, summary.efficiency(), withdrawal_strategy.efficiency);
    let projected_savings = projected_savings(
        summary.total_potential_savings,
        &asset_location,
        &withdrawal_strategy,
        least_efficient_tax_cost(&accounts, portfolio.withdrawal_needs, rates),
        rates,
    );

    info!(
        opportunities = opportunities.len(),
        placements = asset_location.placements.len(),
        overall = efficiency.overall,
        savings = projected_savings.total,
        "tax strategy computed"
    );
    Ok(TaxStrategy {
        as_of,
        asset_location,
        harvesting_opportunities: opportunities,
        harvest_summary: summary,
        withdrawal_strategy,
        efficiency,
        projected_savings,
    })
}

pub fn efficiency_score(location: f64, harvesting: f64, withdrawal: f64) -> TaxEfficiency {
    TaxEfficiency {
        asset_location: location,
        harvesting,
        withdrawal,
        overall: LOCATION_WEIGHT * location + HARVESTING_WEIGHT * harvesting + WITHDRAWAL_WEIGHT * withdrawal,
    }
}

/// Location savings value the drag reduction at the long-term gains rate.
fn projected_savings(
    harvesting: f64,
    location: &AssetLocation,
    withdrawal: &WithdrawalPlan,
    worst_withdrawal_cost: f64,
    rates: &TaxRates,
) -> ProjectedSavings {
    let location_savings =
        ((location.current_tax_drag - location.tax_drag) * rates.capital_gains_rate()).max(0.0);
    let withdrawal_savings = (worst_withdrawal_cost - withdrawal.total_tax_cost).max(0.0);
    ProjectedSavings {
        harvesting,
        location: location_savings,
        withdrawal: withdrawal_savings,
        total: harvesting + location_savings + withdrawal_savings,
    }
}
