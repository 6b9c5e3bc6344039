use std::collections::BTreeMap;

use approx::assert_relative_eq;
use planner_core::{CancellationToken, PlannerError};

use crate::config::{MonteCarloConfig, MonteCarloOverrides, SuccessCriterion};
use crate::generator::{AssetAssumption, ReturnAssumptions};
use crate::scenarios::{compare_scenarios, Scenario, ScenarioModifications};
use crate::simulator::{run_monte_carlo, SimulationInput, SimulationPath};

/// Helper: the 60/40 stocks/bonds retirement scenario.
fn sixty_forty(monthly_contribution: f64) -> SimulationInput {
    let mut allocation = BTreeMap::new();
    allocation.insert("stocks".to_string(), 0.6);
    allocation.insert("bonds".to_string(), 0.4);
    SimulationInput {
        initial_investment: 100_000.0,
        monthly_contribution,
        horizon_years: 10,
        allocation,
        return_assumptions: ReturnAssumptions {
            assets: vec![
                AssetAssumption {
                    symbol: "stocks".to_string(),
                    expected_return: 0.08,
                    volatility: 0.18,
                },
                AssetAssumption {
                    symbol: "bonds".to_string(),
                    expected_return: 0.04,
                    volatility: 0.06,
                },
            ],
            correlation: vec![vec![1.0, -0.1], vec![-0.1, 1.0]],
        },
    }
}

/// Helper: a single riskless asset.
fn riskless(annual_return: f64, initial: f64, years: u32) -> SimulationInput {
    let mut allocation = BTreeMap::new();
    allocation.insert("cash".to_string(), 1.0);
    SimulationInput {
        initial_investment: initial,
        monthly_contribution: 0.0,
        horizon_years: years,
        allocation,
        return_assumptions: ReturnAssumptions {
            assets: vec![AssetAssumption {
                symbol: "cash".to_string(),
                expected_return: annual_return,
                volatility: 0.0,
            }],
            correlation: vec![vec![1.0]],
        },
    }
}

fn config(trials: usize, seed: u64) -> MonteCarloConfig {
    MonteCarloConfig::default().with_simulations(trials).with_seed(seed)
}

#[test]
fn test_sixty_forty_median_in_sanity_band() {
    let output = run_monte_carlo(
        &sixty_forty(1000.0),
        &config(1000, 42),
        &CancellationToken::new(),
    )
    .unwrap();

    let median = output.overall.median_terminal_value;
    assert!(median > 250_000.0 && median < 600_000.0, "median {median}");
    assert_eq!(output.num_simulations, 1000);
    assert_eq!(output.annual.len(), 10);
    assert_eq!(output.paths.len(), 1000);
    assert_eq!(output.paths[0].values.len(), 121);
    assert_eq!(output.paths[0].values[0], 100_000.0);
}

#[test]
fn test_same_seed_identical_statistics() {
    let input = sixty_forty(1000.0);
    let a = run_monte_carlo(&input, &config(300, 7), &CancellationToken::new()).unwrap();
    let b = run_monte_carlo(&input, &config(300, 7), &CancellationToken::new()).unwrap();
    assert_eq!(a.annual, b.annual);
    assert_eq!(a.overall, b.overall);

    let c = run_monte_carlo(&input, &config(300, 8), &CancellationToken::new()).unwrap();
    assert_ne!(a.overall.median_terminal_value, c.overall.median_terminal_value);
}

#[test]
fn test_statistics_independent_of_batch_size() {
    let input = sixty_forty(500.0);
    let mut small = config(200, 3);
    small.batch_size = 7;
    let a = run_monte_carlo(&input, &small, &CancellationToken::new()).unwrap();
    let b = run_monte_carlo(&input, &config(200, 3), &CancellationToken::new()).unwrap();
    assert_eq!(a.overall, b.overall);
}

#[test]
fn test_higher_contribution_never_lowers_median() {
    let cancel = CancellationToken::new();
    let mut previous = f64::MIN;
    for contribution in [0.0, 250.0, 1000.0, 2500.0] {
        let output = run_monte_carlo(&sixty_forty(contribution), &config(400, 11), &cancel).unwrap();
        let median = output.overall.median_terminal_value;
        assert!(median >= previous, "{contribution}: {median} < {previous}");
        previous = median;
    }
}

#[test]
fn test_success_rate_rises_as_target_falls() {
    let output =
        run_monte_carlo(&sixty_forty(1000.0), &config(500, 5), &CancellationToken::new()).unwrap();
    let mut previous = 0.0;
    for target in [900_000.0, 600_000.0, 400_000.0, 300_000.0, 200_000.0, 0.0] {
        let rate = output.success_rate(target, SuccessCriterion::TerminalValue);
        assert!(rate >= previous);
        assert!((0.0..=1.0).contains(&rate));
        previous = rate;
    }
    assert_eq!(output.success_rate(0.0, SuccessCriterion::TerminalValue), 1.0);

    // the path maximum is never below the terminal value
    for target in [300_000.0, 400_000.0] {
        assert!(
            output.success_rate(target, SuccessCriterion::AnyPointMaximum)
                >= output.success_rate(target, SuccessCriterion::TerminalValue)
        );
    }
}

#[test]
fn test_configured_success_target_is_reported() {
    let cfg = config(200, 5).with_success_target(300_000.0, SuccessCriterion::TerminalValue);
    let output = run_monte_carlo(&sixty_forty(1000.0), &cfg, &CancellationToken::new()).unwrap();
    assert_eq!(
        output.overall.success_rate,
        Some(output.success_rate(300_000.0, SuccessCriterion::TerminalValue))
    );
}

#[test]
fn test_drawdowns_and_tail_measures_are_consistent() {
    let output =
        run_monte_carlo(&sixty_forty(1000.0), &config(300, 9), &CancellationToken::new()).unwrap();
    for path in &output.paths {
        let dd = path.max_drawdown();
        assert!((0.0..=1.0).contains(&dd));
    }
    for year in &output.annual {
        assert!(year.conditional_value_at_risk <= year.value_at_risk);
        let mut previous_width = f64::INFINITY;
        for band in &year.confidence_bands {
            assert!(band.lower <= year.median && year.median <= band.upper);
            let width = band.upper - band.lower;
            assert!(width <= previous_width);
            previous_width = width;
        }
    }
    let risk = &output.overall.risk;
    assert!(risk.median_max_drawdown <= risk.worst_max_drawdown);
    assert!(risk.conditional_value_at_risk <= risk.value_at_risk);
}

#[test]
fn test_risk_adjusted_returns_reported() {
    let output =
        run_monte_carlo(&sixty_forty(500.0), &config(300, 21), &CancellationToken::new()).unwrap();
    let risk = &output.overall.risk;
    let sharpe = risk.median_sharpe_ratio.unwrap();
    let sortino = risk.median_sortino_ratio.unwrap();
    // 6.4% expected against a 2% risk-free rate at roughly 11% volatility
    assert!(sharpe > 0.0 && sharpe < 1.5, "{sharpe}");
    assert!(sortino > 0.0, "{sortino}");
    assert!(risk.outcome_volatility > 0.0);

    let riskless = run_monte_carlo(
        &riskless(0.05, 1000.0, 3),
        &config(5, 1).with_fees(false),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(riskless.overall.risk.median_sharpe_ratio, None);
    assert_eq!(riskless.overall.risk.median_sortino_ratio, None);
}

#[test]
fn test_monthly_returns_exclude_contributions() {
    let path = SimulationPath {
        trial: 0,
        values: vec![1000.0, 1110.0, 0.0, 50.0],
    };
    let returns = path.monthly_returns(&[100.0, 100.0, 50.0]);
    assert_eq!(returns.len(), 2);
    assert_relative_eq!(returns[0], 0.01, epsilon = 1e-12);
    assert_relative_eq!(returns[1], -1.0 - 100.0 / 1110.0, epsilon = 1e-12);
}

#[test]
fn test_riskless_growth_compounds_exactly() {
    let output = run_monte_carlo(
        &riskless(0.12, 1000.0, 2),
        &config(3, 1).with_fees(false),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_relative_eq!(output.annual[0].median, 1120.0, epsilon = 1e-8);
    assert_relative_eq!(output.overall.median_terminal_value, 1254.4, epsilon = 1e-8);
    assert_eq!(output.annual[1].std_dev, 0.0);
}

#[test]
fn test_fees_are_charged_monthly() {
    let output = run_monte_carlo(
        &riskless(0.0, 1000.0, 1),
        &config(1, 1),
        &CancellationToken::new(),
    )
    .unwrap();
    let expected = 1000.0 * (1.0 - 0.003 / 12.0_f64).powi(12);
    assert_relative_eq!(output.overall.median_terminal_value, expected, epsilon = 1e-8);
}

#[test]
fn test_contributions_grow_with_inflation() {
    let mut input = riskless(0.0, 0.0, 1);
    input.monthly_contribution = 100.0;
    let mut cfg = config(1, 1).with_fees(false);
    cfg.inflation_rate = 0.0;
    let output = run_monte_carlo(&input, &cfg, &CancellationToken::new()).unwrap();
    assert_relative_eq!(output.overall.median_terminal_value, 1200.0, epsilon = 1e-9);

    cfg.inflation_rate = 0.03;
    let output = run_monte_carlo(&input, &cfg, &CancellationToken::new()).unwrap();
    assert!(output.overall.median_terminal_value > 1200.0);
    assert_relative_eq!(
        output.overall.median_terminal_value,
        output.overall.total_contributions,
        epsilon = 1e-9
    );
}

#[test]
fn test_cancelled_run_returns_no_statistics() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run_monte_carlo(&sixty_forty(1000.0), &config(100, 1), &cancel).unwrap_err();
    assert_eq!(err, PlannerError::Cancelled);
}

#[test]
fn test_allocation_must_reference_known_assets() {
    let mut input = sixty_forty(1000.0);
    input.allocation.remove("bonds");
    input.allocation.insert("gold".to_string(), 0.4);
    let err = run_monte_carlo(&input, &config(10, 1), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "allocation[gold]"));
}

#[test]
fn test_zero_horizon_is_insufficient_data() {
    let mut input = sixty_forty(1000.0);
    input.horizon_years = 0;
    let err = run_monte_carlo(&input, &config(10, 1), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PlannerError::InsufficientData(_)));
}

#[test]
fn test_paths_can_be_dropped() {
    let mut cfg = config(20, 1);
    cfg.keep_paths = false;
    let output = run_monte_carlo(&sixty_forty(1000.0), &cfg, &CancellationToken::new()).unwrap();
    assert!(output.paths.is_empty());
    assert_eq!(output.terminal_values().len(), 20);
}

fn all_bonds() -> ScenarioModifications {
    let mut allocation = BTreeMap::new();
    allocation.insert("bonds".to_string(), 1.0);
    ScenarioModifications {
        allocation: Some(allocation),
        ..Default::default()
    }
}

#[test]
fn test_scenarios_ranked_by_success_rate() {
    let scenarios = vec![
        Scenario::new("all bonds", all_bonds()),
        Scenario::new(
            "save more",
            ScenarioModifications {
                monthly_contribution: Some(1500.0),
                ..Default::default()
            },
        ),
    ];
    let cfg = config(300, 17).with_success_target(250_000.0, SuccessCriterion::TerminalValue);
    let comparison = compare_scenarios(
        &sixty_forty(500.0),
        &cfg,
        &scenarios,
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(comparison.outcomes.len(), 3);
    assert_eq!(comparison.outcomes[0].name, "base");
    assert_eq!(comparison.ranking, vec!["save more", "base", "all bonds"]);
    assert_eq!(comparison.best().unwrap().name, "save more");

    let base = comparison.outcome("base").unwrap();
    let save_more = comparison.outcome("save more").unwrap();
    assert_eq!(save_more.rank, 1);
    assert_eq!(save_more.success_target, 250_000.0);
    assert!(save_more.success_rate_change > 0.0);
    assert!(save_more.median_terminal_change > 0.0);
    assert_relative_eq!(
        save_more.success_rate_change,
        save_more.success_rate - base.success_rate,
        epsilon = 1e-12
    );
    assert_eq!(base.success_rate_change, 0.0);

    let bonds = comparison.outcome("all bonds").unwrap();
    assert!(bonds.risk.median_max_drawdown < base.risk.median_max_drawdown);
}

#[test]
fn test_scenario_without_target_measures_break_even() {
    let scenarios = vec![Scenario::new(
        "lower fees",
        ScenarioModifications {
            config: MonteCarloOverrides {
                include_fees: Some(false),
                ..Default::default()
            },
            ..Default::default()
        },
    )];
    let comparison = compare_scenarios(
        &sixty_forty(1000.0),
        &config(200, 5),
        &scenarios,
        &CancellationToken::new(),
    )
    .unwrap();
    let base = comparison.outcome("base").unwrap();
    let no_fees = comparison.outcome("lower fees").unwrap();
    assert_relative_eq!(base.success_target, base.total_contributions);
    assert_relative_eq!(base.success_rate, 1.0 - base.risk.probability_of_loss, epsilon = 1e-12);
    // same draws without the fee drag
    assert!(no_fees.median_terminal_value > base.median_terminal_value);
    assert!(no_fees.success_rate >= base.success_rate);
}

#[test]
fn test_invalid_scenario_names_its_index() {
    let mut allocation = BTreeMap::new();
    allocation.insert("gold".to_string(), 1.0);
    let scenarios = vec![
        Scenario::new("all bonds", all_bonds()),
        Scenario::new(
            "gold",
            ScenarioModifications {
                allocation: Some(allocation),
                ..Default::default()
            },
        ),
    ];
    let err = compare_scenarios(
        &sixty_forty(1000.0),
        &config(20, 1),
        &scenarios,
        &CancellationToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios[1].allocation[gold]"));
}

#[test]
fn test_cancelled_comparison_fails() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = compare_scenarios(
        &sixty_forty(1000.0),
        &config(50, 1),
        &[Scenario::new("all bonds", all_bonds())],
        &cancel,
    )
    .unwrap_err();
    assert_eq!(err, PlannerError::Cancelled);
}
