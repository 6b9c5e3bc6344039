use monte_carlo::{MonteCarloOverrides, Scenario, SimulationInput};
use portfolio_optimizer::{OptimizationInput, OptimizerOverrides};
use serde::{Deserialize, Serialize};
use tax_optimizer::{TaxOverrides, TaxPortfolio, TaxRates};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRequest {
    #[serde(flatten)]
    pub input: OptimizationInput,
    #[serde(default)]
    pub config: OptimizerOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    #[serde(flatten)]
    pub input: SimulationInput,
    #[serde(default)]
    pub config: MonteCarloOverrides,
}

/// A base projection and the variations to compare against it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRequest {
    #[serde(flatten)]
    pub input: SimulationInput,
    #[serde(default)]
    pub config: MonteCarloOverrides,
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxStrategyRequest {
    pub portfolio: TaxPortfolio,
    #[serde(default)]
    pub tax_rates: TaxRates,
    #[serde(default)]
    pub config: TaxOverrides,
}

/// Same portfolio, rates and overrides; projection assumptions travel in
/// `config.projection`
pub type TaxProjectionRequest = TaxStrategyRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierRequest {
    #[serde(flatten)]
    pub input: OptimizationInput,
    /// Engine default when omitted
    #[serde(default)]
    pub num_points: Option<usize>,
    #[serde(default)]
    pub config: OptimizerOverrides,
}
