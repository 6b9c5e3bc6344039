//! Scenario comparison.
//!
//! Each scenario is the base projection with some inputs replaced and some
//! config options overridden. Every scenario reuses the base seed unless it
//! overrides it, so the trials see the same market draws and differences in
//! outcome come from the modifications alone.

use std::cmp::Ordering;
use std::collections::HashSet;

use planner_core::{Allocation, CancellationToken, PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::config::{MonteCarloConfig, MonteCarloOverrides};
use crate::generator::ReturnAssumptions;
use crate::simulator::{run_monte_carlo, MonteCarloOutput, RiskMetrics, SimulationInput};

/// Name the unmodified projection is reported under
pub const BASE_SCENARIO: &str = "base";

/// Inputs a scenario replaces; unset fields keep the base value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioModifications {
    pub initial_investment: Option<f64>,
    pub monthly_contribution: Option<f64>,
    pub horizon_years: Option<u32>,
    pub allocation: Option<Allocation>,
    pub return_assumptions: Option<ReturnAssumptions>,
    pub config: MonteCarloOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub modifications: ScenarioModifications,
}

impl Scenario {
    pub fn new(name: impl Into<String>, modifications: ScenarioModifications) -> Self {
        Self {
            name: name.into(),
            modifications,
        }
    }

    /// The base input and config with this scenario's changes applied.
    pub fn apply(
        &self,
        base: &SimulationInput,
        config: &MonteCarloConfig,
    ) -> (SimulationInput, MonteCarloConfig) {
        let changes = &self.modifications;
        let input = SimulationInput {
            initial_investment: changes
                .initial_investment
                .unwrap_or(base.initial_investment),
            monthly_contribution: changes
                .monthly_contribution
                .unwrap_or(base.monthly_contribution),
            horizon_years: changes.horizon_years.unwrap_or(base.horizon_years),
            allocation: changes
                .allocation
                .clone()
                .unwrap_or_else(|| base.allocation.clone()),
            return_assumptions: changes
                .return_assumptions
                .clone()
                .unwrap_or_else(|| base.return_assumptions.clone()),
        };
        (input, config.merge(&changes.config))
    }
}

/// Summary of one projection within a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    /// 1 for the best scenario
    pub rank: usize,
    /// Configured target, or the total contributed when none is set
    pub success_target: f64,
    pub success_rate: f64,
    pub mean_terminal_value: f64,
    pub median_terminal_value: f64,
    pub total_contributions: f64,
    pub risk: RiskMetrics,
    /// Difference to the base projection
    pub success_rate_change: f64,
    pub median_terminal_change: f64,
}

impl ScenarioOutcome {
    fn from_output(name: &str, output: &MonteCarloOutput, config: &MonteCarloConfig) -> Self {
        let overall = &output.overall;
        let success_target = config
            .success_target
            .unwrap_or(overall.total_contributions);
        Self {
            name: name.to_string(),
            rank: 0,
            success_target,
            success_rate: output.success_rate(success_target, config.success_criterion),
            mean_terminal_value: overall.mean_terminal_value,
            median_terminal_value: overall.median_terminal_value,
            total_contributions: overall.total_contributions,
            risk: overall.risk.clone(),
            success_rate_change: 0.0,
            median_terminal_change: 0.0,
        }
    }

    /// Higher success rate first, then the shallower median drawdown, then
    /// the lower probability of loss.
    fn ranking_order(&self, other: &Self) -> Ordering {
        other
            .success_rate
            .total_cmp(&self.success_rate)
            .then(self.risk.median_max_drawdown.total_cmp(&other.risk.median_max_drawdown))
            .then(self.risk.probability_of_loss.total_cmp(&other.risk.probability_of_loss))
            .then_with(|| self.name.cmp(&other.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    /// Base first, then the scenarios in request order
    pub outcomes: Vec<ScenarioOutcome>,
    /// Outcome names, best first
    pub ranking: Vec<String>,
}

impl ScenarioComparison {
    pub fn best(&self) -> Option<&ScenarioOutcome> {
        self.outcomes.iter().find(|o| o.rank == 1)
    }

    pub fn outcome(&self, name: &str) -> Option<&ScenarioOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

fn validate_scenarios(scenarios: &[Scenario]) -> PlannerResult<()> {
    if scenarios.is_empty() {
        return Err(PlannerError::validation(
            "scenarios",
            "at least one scenario is required",
        ));
    }
    let mut names = HashSet::new();
    for (i, scenario) in scenarios.iter().enumerate() {
        let name = scenario.name.trim();
        if name.is_empty() {
            return Err(PlannerError::validation(
                format!("scenarios[{i}].name"),
                "must not be empty",
            ));
        }
        if name == BASE_SCENARIO || !names.insert(name) {
            return Err(PlannerError::validation(
                format!("scenarios[{i}].name"),
                format!("duplicate scenario name {name}"),
            ));
        }
    }
    Ok(())
}

/// Prefix a validation field with the scenario it came from.
fn within_scenario(index: usize, err: PlannerError) -> PlannerError {
    match err {
        PlannerError::Validation { field, reason } => {
            PlannerError::validation(format!("scenarios[{index}].{field}"), reason)
        }
        other => other,
    }
}

/// Run the base projection and every scenario, then rank them all.
pub fn compare_scenarios(
    base: &SimulationInput,
    config: &MonteCarloConfig,
    scenarios: &[Scenario],
    cancel: &CancellationToken,
) -> PlannerResult<ScenarioComparison> {
    let _span = info_span!("compare_scenarios", scenarios = scenarios.len()).entered();
    validate_scenarios(scenarios)?;

    // only summaries are reported
    let base_config = MonteCarloConfig {
        keep_paths: false,
        ..config.clone()
    };
    let base_output = run_monte_carlo(base, &base_config, cancel)?;
    let base_outcome = ScenarioOutcome::from_output(BASE_SCENARIO, &base_output, &base_config);

    let mut outcomes = Vec::with_capacity(scenarios.len() + 1);
    for (i, scenario) in scenarios.iter().enumerate() {
        let (input, scenario_config) = scenario.apply(base, &base_config);
        let output =
            run_monte_carlo(&input, &scenario_config, cancel).map_err(|e| within_scenario(i, e))?;
        let mut outcome =
            ScenarioOutcome::from_output(scenario.name.trim(), &output, &scenario_config);
        outcome.success_rate_change = outcome.success_rate - base_outcome.success_rate;
        outcome.median_terminal_change =
            outcome.median_terminal_value - base_outcome.median_terminal_value;
        outcomes.push(outcome);
    }
    outcomes.insert(0, base_outcome);

    let mut order: Vec<usize> = (0..outcomes.len()).collect();
    order.sort_by(|&a, &b| outcomes[a].ranking_order(&outcomes[b]));
    for (position, &index) in order.iter().enumerate() {
        outcomes[index].rank = position + 1;
    }
    let ranking: Vec<String> = order.iter().map(|&i| outcomes[i].name.clone()).collect();

    info!(best = %ranking[0], compared = outcomes.len(), "scenario comparison complete");
    Ok(ScenarioComparison { outcomes, ranking })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_must_be_unique_and_not_base() {
        let err = validate_scenarios(&[]).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios"));

        let named = |name: &str| Scenario::new(name, ScenarioModifications::default());
        let err = validate_scenarios(&[named("save more"), named(" save more ")]).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios[1].name"));

        let err = validate_scenarios(&[named("base")]).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios[0].name"));

        let err = validate_scenarios(&[named("  ")]).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios[0].name"));
    }

    #[test]
    fn test_validation_errors_name_the_scenario() {
        let err = within_scenario(2, PlannerError::validation("horizon_years", "must be positive"));
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "scenarios[2].horizon_years"));
        assert!(matches!(within_scenario(0, PlannerError::Cancelled), PlannerError::Cancelled));
    }
}
