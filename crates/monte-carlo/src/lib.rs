//! Correlated monthly return generation and Monte Carlo wealth projection.
//!
//! Trials run in parallel with rayon. Each trial draws from its own seeded
//! stream, so a fixed seed reproduces the same statistics regardless of
//! thread count.

pub mod config;
pub mod generator;
pub mod scenarios;
pub mod simulator;
#[cfg(test)]
mod tests;

pub use config::{FeeStructure, MonteCarloConfig, MonteCarloOverrides, SuccessCriterion};
pub use generator::{AssetAssumption, CorrelatedReturnGenerator, ReturnAssumptions};
pub use scenarios::{
    compare_scenarios, Scenario, ScenarioComparison, ScenarioModifications, ScenarioOutcome,
};
pub use simulator::{
    run_monte_carlo, ConfidenceBand, MonteCarloOutput, MonteCarloSimulator, OverallStatistics,
    RiskMetrics, SimulationInput, SimulationPath, YearStatistics,
};
