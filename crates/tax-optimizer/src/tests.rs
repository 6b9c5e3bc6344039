use approx::assert_relative_eq;
use chrono::NaiveDate;
use planner_core::{AccountType, Asset, AssetClass, PlannerError};

use crate::models::{Account, TaxConfig, TaxPortfolio};
use crate::projection::{project_tax_liability, ProjectionAssumptions};
use crate::strategy::compute_tax_strategy;
use crate::tax_calculator::TaxRates;
use crate::wash_sale::{TradeRecord, TradeSide};

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 15).unwrap()
}

fn config() -> TaxConfig {
    TaxConfig::default().with_as_of(as_of()).with_harvest_threshold(1000.0)
}

fn spy_agg(agg_value: f64) -> TaxPortfolio {
    TaxPortfolio::new(vec![
        Asset::new("SPY", 0.08, 0.18).with_position(100.0, 45_075.0, 42_000.0),
        Asset::new("AGG", 0.04, 0.05)
            .with_class(AssetClass::Bonds)
            .with_position(200.0, agg_value, 19_500.0),
    ])
}

#[test]
fn test_no_opportunity_below_threshold() {
    let strategy = compute_tax_strategy(&spy_agg(20_000.0), &TaxRates::default(), &config()).unwrap();
    assert!(strategy.harvesting_opportunities.is_empty());
    assert_relative_eq!(strategy.harvest_summary.total_identified_loss, 0.0);
    assert_relative_eq!(strategy.efficiency.harvesting, 1.0);
}

#[test]
fn test_bond_loss_is_harvestable_with_substitute() {
    let strategy = compute_tax_strategy(&spy_agg(18_000.0), &TaxRates::default(), &config()).unwrap();

    assert_eq!(strategy.harvesting_opportunities.len(), 1);
    let opp = &strategy.harvesting_opportunities[0];
    assert_eq!(opp.symbol, "AGG");
    assert_relative_eq!(opp.unrealized_loss, 1_500.0);
    assert!(opp.potential_savings > 0.0);
    assert_relative_eq!(opp.potential_savings, 1_500.0 * TaxRates::default().capital_gains_rate());
    assert!(opp.alternatives.iter().any(|a| a.correlation >= 0.95));
    assert!(opp.alternatives.len() <= 3);
    assert!(!opp.wash_sale_risk);
    assert_relative_eq!(strategy.projected_savings.harvesting, opp.potential_savings);
}

#[test]
fn test_threshold_is_inclusive_and_configurable() {
    let portfolio = spy_agg(18_500.0);
    let strategy = compute_tax_strategy(&portfolio, &TaxRates::default(), &config()).unwrap();
    assert_eq!(strategy.harvesting_opportunities.len(), 1);

    let strict = config().with_harvest_threshold(1_000.01);
    let strategy = compute_tax_strategy(&portfolio, &TaxRates::default(), &strict).unwrap();
    assert!(strategy.harvesting_opportunities.is_empty());
}

#[test]
fn test_niit_raises_savings() {
    let rates = TaxRates {
        niit_applies: true,
        ..TaxRates::default()
    };
    let strategy = compute_tax_strategy(&spy_agg(18_000.0), &rates, &config()).unwrap();
    assert_relative_eq!(
        strategy.harvesting_opportunities[0].potential_savings,
        1_500.0 * (0.15 + 0.05 + 0.038),
        epsilon = 1e-9
    );
}

#[test]
fn test_wash_sale_flag_follows_window() {
    let inside = spy_agg(18_000.0).with_trades(vec![TradeRecord::new(
        "AGG",
        TradeSide::Buy,
        NaiveDate::from_ymd_opt(2024, 9, 15).unwrap(),
    )]);
    let strategy = compute_tax_strategy(&inside, &TaxRates::default(), &config()).unwrap();
    assert!(strategy.harvesting_opportunities[0].wash_sale_risk);
    assert_relative_eq!(strategy.efficiency.harvesting, 0.0);
    assert_relative_eq!(strategy.projected_savings.harvesting, 0.0);

    let outside = spy_agg(18_000.0).with_trades(vec![TradeRecord::new(
        "AGG",
        TradeSide::Buy,
        NaiveDate::from_ymd_opt(2024, 9, 14).unwrap(),
    )]);
    let strategy = compute_tax_strategy(&outside, &TaxRates::default(), &config()).unwrap();
    assert!(!strategy.harvesting_opportunities[0].wash_sale_risk);
}

#[test]
fn test_full_strategy_scores_and_savings() {
    let portfolio = TaxPortfolio::new(vec![
        Asset::new("AGG", 0.04, 0.05)
            .with_class(AssetClass::Bonds)
            .with_position(300.0, 30_000.0, 31_000.0),
        Asset::new("QQQ", 0.10, 0.22)
            .with_position(50.0, 20_000.0, 23_000.0)
            .with_account(AccountType::TaxExempt),
        Asset::new("VNQ", 0.07, 0.20)
            .with_class(AssetClass::RealEstate)
            .with_position(60.0, 20_000.0, 18_000.0)
            .with_account(AccountType::TaxDeferred),
        Asset::new("VTI", 0.08, 0.17).with_position(100.0, 30_000.0, 24_000.0),
    ])
    .with_accounts(vec![
        Account::new("brokerage", AccountType::Taxable, 60_000.0).with_cost_basis(55_000.0),
        Account::new("ira", AccountType::TaxDeferred, 30_000.0),
        Account::new("roth", AccountType::TaxExempt, 20_000.0),
    ])
    .with_withdrawal(40_000.0);

    let strategy = compute_tax_strategy(&portfolio, &TaxRates::default(), &config()).unwrap();

    for usage in &strategy.asset_location.accounts {
        assert!(usage.assigned <= usage.capacity + 1e-6);
    }
    let bond = strategy
        .asset_location
        .placements
        .iter()
        .find(|p| p.symbol == "AGG")
        .unwrap();
    assert_eq!(bond.account_type, AccountType::TaxDeferred);
    assert!(strategy.asset_location.score >= strategy.asset_location.current_score);

    // QQQ sits in the Roth, so only AGG is a harvesting candidate
    assert_eq!(strategy.harvesting_opportunities.len(), 1);

    let steps = &strategy.withdrawal_strategy.steps;
    assert_eq!(steps[0].account_id, "brokerage");
    assert_relative_eq!(strategy.withdrawal_strategy.total_withdrawn, 40_000.0, epsilon = 1e-9);
    assert!(strategy.projected_savings.withdrawal > 0.0);

    let e = strategy.efficiency;
    assert_relative_eq!(
        e.overall,
        0.4 * e.asset_location + 0.3 * e.harvesting + 0.3 * e.withdrawal,
        epsilon = 1e-12
    );
    let s = strategy.projected_savings;
    assert_relative_eq!(s.total, s.harvesting + s.location + s.withdrawal, epsilon = 1e-9);
}

#[test]
fn test_identical_inputs_give_identical_strategy() {
    let portfolio = spy_agg(18_000.0).with_withdrawal(5_000.0);
    let a = compute_tax_strategy(&portfolio, &TaxRates::default(), &config()).unwrap();
    let b = compute_tax_strategy(&portfolio, &TaxRates::default(), &config()).unwrap();
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn test_requires_evaluation_date() {
    let err = compute_tax_strategy(&spy_agg(18_000.0), &TaxRates::default(), &TaxConfig::default())
        .unwrap_err();
    assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "config.as_of"));
}

#[test]
fn test_portfolio_from_json() {
    let json = r#"{
        "assets": [
            {"symbol": "VNQ", "asset_class": "reits", "market_value": 9000, "cost_basis": 11000, "quantity": 100}
        ],
        "accounts": [
            {"id": "roth", "account_type": "roth_ira", "balance": 9000}
        ],
        "recent_trades": [
            {"symbol": "SCHH", "side": "buy", "date": "2024-10-01"}
        ]
    }"#;
    let portfolio: TaxPortfolio = serde_json::from_str(json).unwrap();
    assert_eq!(portfolio.accounts[0].account_type, AccountType::TaxExempt);
    assert_eq!(portfolio.recent_trades[0].side, TradeSide::Buy);

    let strategy = compute_tax_strategy(&portfolio, &TaxRates::default(), &config()).unwrap();
    // SCHH is a different index from VNQ, so buying it is no wash sale
    assert!(!strategy.harvesting_opportunities[0].wash_sale_risk);
    assert_eq!(strategy.asset_location.placements[0].account_id, "roth");
}

fn projection_config(years: u32) -> TaxConfig {
    let mut config = TaxConfig::default();
    config.projection = ProjectionAssumptions {
        wage_income: 50_000.0,
        income_growth: 0.0,
        equity_growth: 0.05,
        bond_growth: 0.0,
        dividend_yield: 0.02,
        interest_yield: 0.04,
        qualified_dividend_ratio: 1.0,
        turnover: 0.0,
        deduction: 0.0,
        ..ProjectionAssumptions::default().with_years(years)
    };
    config
}

#[test]
fn test_tax_liability_projection_by_year() {
    let portfolio = TaxPortfolio::new(vec![
        Asset::new("VTI", 0.08, 0.17).with_position(400.0, 100_000.0, 100_000.0),
        Asset::new("BND", 0.04, 0.05)
            .with_class(AssetClass::Bonds)
            .with_position(600.0, 50_000.0, 50_000.0)
            .with_account(AccountType::TaxDeferred),
    ]);
    let projection = project_tax_liability(&portfolio, &TaxRates::default(), &projection_config(3)).unwrap();

    assert_eq!(projection.projections.len(), 3);
    let first = &projection.projections[0];
    assert_eq!(first.year, 1);
    assert_relative_eq!(first.ordinary_income, 50_000.0);
    assert_relative_eq!(first.preferential_income, 2_000.0, epsilon = 1e-9);
    assert_relative_eq!(first.ordinary_income_tax, 12_000.0, epsilon = 1e-9);
    assert_relative_eq!(first.capital_gains_tax, 300.0, epsilon = 1e-9);
    assert_relative_eq!(first.state_tax, 2_600.0, epsilon = 1e-9);
    assert_relative_eq!(first.niit, 0.0);
    assert_relative_eq!(first.total_tax, 14_900.0, epsilon = 1e-9);
    assert_relative_eq!(first.taxable_value, 107_000.0, epsilon = 1e-9);

    // reinvested dividends compound, so each year's tax is higher
    let second = &projection.projections[1];
    assert_relative_eq!(second.preferential_income, 2_140.0, epsilon = 1e-9);
    assert_relative_eq!(second.total_tax, 14_928.0, epsilon = 1e-9);

    let summary = &projection.summary;
    assert_eq!(summary.peak_year, 3);
    assert_relative_eq!(
        summary.total_tax,
        projection.projections.iter().map(|y| y.total_tax).sum::<f64>(),
        epsilon = 1e-9
    );
    assert_relative_eq!(summary.average_annual_tax, summary.total_tax / 3.0, epsilon = 1e-9);
    assert_relative_eq!(summary.ending_tax_deferred_value, 50_000.0 * 1.04_f64.powi(3), epsilon = 1e-6);
    assert_relative_eq!(
        summary.deferred_tax_liability,
        summary.ending_tax_deferred_value * 0.29,
        epsilon = 1e-6
    );
    assert_relative_eq!(summary.ending_unrealized_gain, 122_504.3 - 106_429.8, epsilon = 1e-6);
}

#[test]
fn test_projection_without_holdings_taxes_wages_only() {
    let projection =
        project_tax_liability(&TaxPortfolio::default(), &TaxRates::default(), &projection_config(2)).unwrap();
    for year in &projection.projections {
        assert_relative_eq!(year.investment_income, 0.0);
        assert_relative_eq!(year.total_tax, 50_000.0 * 0.29, epsilon = 1e-9);
    }
    assert_eq!(projection.summary.peak_year, 1);
    assert_relative_eq!(projection.summary.average_effective_rate, 0.29, epsilon = 1e-12);
}
