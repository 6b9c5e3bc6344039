use std::env;
use std::str::FromStr;

use monte_carlo::MonteCarloConfig;
use planner_core::validation::{ensure_non_negative, ensure_positive, ensure_rate};
use planner_core::{PlannerError, PlannerResult};
use portfolio_optimizer::{OptimizerConfig, DEFAULT_FRONTIER_POINTS};
use serde::{Deserialize, Serialize};
use tax_optimizer::TaxConfig;

/// Engine-wide defaults shared by every request. Per-request overrides are
/// merged on top of the configs derived from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub risk_free_rate: f64,
    pub bl_tau: f64,
    pub risk_aversion: f64,
    pub num_simulations: usize,
    pub num_resamples: usize,
    pub frontier_points: usize,
    pub harvest_threshold: f64,
    pub wash_sale_days: u32,
    /// Seed for every stochastic operation; component defaults when unset
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            bl_tau: 0.025,
            risk_aversion: 3.0,
            num_simulations: 1000,
            num_resamples: 1000,
            frontier_points: DEFAULT_FRONTIER_POINTS,
            harvest_threshold: 1000.0,
            wash_sale_days: 30,
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> PlannerResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> PlannerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            risk_free_rate: parse_or(&lookup, "PLANNER_RISK_FREE_RATE", defaults.risk_free_rate)?,
            bl_tau: parse_or(&lookup, "PLANNER_BL_TAU", defaults.bl_tau)?,
            risk_aversion: parse_or(&lookup, "PLANNER_RISK_AVERSION", defaults.risk_aversion)?,
            num_simulations: parse_or(&lookup, "PLANNER_NUM_SIMULATIONS", defaults.num_simulations)?,
            num_resamples: parse_or(&lookup, "PLANNER_NUM_RESAMPLES", defaults.num_resamples)?,
            frontier_points: parse_or(&lookup, "PLANNER_FRONTIER_POINTS", defaults.frontier_points)?,
            harvest_threshold: parse_or(&lookup, "PLANNER_HARVEST_THRESHOLD", defaults.harvest_threshold)?,
            wash_sale_days: parse_or(&lookup, "PLANNER_WASH_SALE_DAYS", defaults.wash_sale_days)?,
            seed: parse_optional(&lookup, "PLANNER_SEED")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PlannerResult<()> {
        ensure_rate(self.risk_free_rate, "PLANNER_RISK_FREE_RATE")?;
        ensure_positive(self.bl_tau, "PLANNER_BL_TAU")?;
        ensure_positive(self.risk_aversion, "PLANNER_RISK_AVERSION")?;
        ensure_non_negative(self.harvest_threshold, "PLANNER_HARVEST_THRESHOLD")?;
        for (value, name) in [
            (self.num_simulations, "PLANNER_NUM_SIMULATIONS"),
            (self.num_resamples, "PLANNER_NUM_RESAMPLES"),
            (self.frontier_points, "PLANNER_FRONTIER_POINTS"),
        ] {
            if value == 0 {
                return Err(PlannerError::validation(name, "must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        let mut config = OptimizerConfig {
            risk_free_rate: self.risk_free_rate,
            tau: self.bl_tau,
            risk_aversion: self.risk_aversion,
            num_resamples: self.num_resamples,
            ..OptimizerConfig::default()
        };
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config
    }

    pub fn monte_carlo_config(&self) -> MonteCarloConfig {
        let config = MonteCarloConfig::default()
            .with_simulations(self.num_simulations)
            .with_risk_free_rate(self.risk_free_rate);
        match self.seed {
            Some(seed) => config.with_seed(seed),
            None => config,
        }
    }

    pub fn tax_config(&self) -> TaxConfig {
        TaxConfig::default()
            .with_harvest_threshold(self.harvest_threshold)
            .with_wash_sale_window(self.wash_sale_days)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> PlannerResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> PlannerResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PlannerError::validation(key, format!("cannot parse '{raw}'"))),
    }
}
