use planner_core::validation::{ensure_non_negative, ensure_open_unit, ensure_rate};
use planner_core::{PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_SEED: u64 = 0x5EED_2024;

/// Annual fee rates charged by the simulated account
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeStructure {
    /// Annual management fee on assets (0.25% default)
    pub management_fee: f64,
    /// Cost per unit of traded value when rebalancing (0.10% default)
    pub trading_costs: f64,
    /// Annual administration fee on assets (0.05% default)
    pub admin_fee: f64,
}

impl Default for FeeStructure {
    fn default() -> Self {
        Self {
            management_fee: 0.0025,
            trading_costs: 0.0010,
            admin_fee: 0.0005,
        }
    }
}

impl FeeStructure {
    /// Fraction of value charged each month for management and admin.
    pub fn monthly_asset_fee(&self) -> f64 {
        (self.management_fee + self.admin_fee) / 12.0
    }

    fn validate(&self) -> PlannerResult<()> {
        ensure_open_or_zero(self.management_fee, "config.fee_structure.management_fee")?;
        ensure_open_or_zero(self.trading_costs, "config.fee_structure.trading_costs")?;
        ensure_open_or_zero(self.admin_fee, "config.fee_structure.admin_fee")
    }
}

fn ensure_open_or_zero(value: f64, field: &str) -> PlannerResult<()> {
    ensure_non_negative(value, field)?;
    if value >= 1.0 {
        return Err(PlannerError::validation(field, format!("must be < 1, got {value}")));
    }
    Ok(())
}

/// How a trial is judged against a wealth target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCriterion {
    /// Terminal value meets the target
    #[default]
    TerminalValue,
    /// The path maximum meets the target at any month
    AnyPointMaximum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub version: u32,
    pub num_simulations: usize,
    /// Two-sided band levels, each in (0, 1)
    pub confidence_intervals: Vec<f64>,
    pub inflation_rate: f64,
    pub rebalance_frequency_months: u32,
    pub include_fees: bool,
    pub fee_structure: FeeStructure,
    /// Tail probability for VaR / CVaR of the annual snapshots
    pub var_alpha: f64,
    /// Annual rate the Sharpe and Sortino ratios are measured against
    pub risk_free_rate: f64,
    /// Wealth target reported in the overall statistics when set
    pub success_target: Option<f64>,
    pub success_criterion: SuccessCriterion,
    pub seed: u64,
    /// Trials per cancellation checkpoint
    pub batch_size: usize,
    /// Return the monthly path of every trial
    pub keep_paths: bool,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            num_simulations: 1000,
            confidence_intervals: vec![0.95, 0.75, 0.5],
            inflation_rate: 0.03,
            rebalance_frequency_months: 12,
            include_fees: true,
            fee_structure: FeeStructure::default(),
            var_alpha: 0.05,
            risk_free_rate: 0.02,
            success_target: None,
            success_criterion: SuccessCriterion::TerminalValue,
            seed: DEFAULT_SEED,
            batch_size: 128,
            keep_paths: true,
        }
    }
}

/// Partial update applied by [`MonteCarloConfig::merge`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloOverrides {
    pub num_simulations: Option<usize>,
    pub confidence_intervals: Option<Vec<f64>>,
    pub inflation_rate: Option<f64>,
    pub rebalance_frequency_months: Option<u32>,
    pub include_fees: Option<bool>,
    pub fee_structure: Option<FeeStructure>,
    pub var_alpha: Option<f64>,
    pub risk_free_rate: Option<f64>,
    pub success_target: Option<f64>,
    pub success_criterion: Option<SuccessCriterion>,
    pub seed: Option<u64>,
    pub keep_paths: Option<bool>,
}

impl MonteCarloConfig {
    pub fn with_simulations(mut self, num_simulations: usize) -> Self {
        self.num_simulations = num_simulations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_fees(mut self, include_fees: bool) -> Self {
        self.include_fees = include_fees;
        self
    }

    pub fn with_success_target(mut self, target: f64, criterion: SuccessCriterion) -> Self {
        self.success_target = Some(target);
        self.success_criterion = criterion;
        self
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    pub fn with_rebalance_frequency(mut self, months: u32) -> Self {
        self.rebalance_frequency_months = months;
        self
    }

    /// New config with every set override applied.
    pub fn merge(&self, overrides: &MonteCarloOverrides) -> Self {
        Self {
            version: self.version,
            num_simulations: overrides.num_simulations.unwrap_or(self.num_simulations),
            confidence_intervals: overrides
                .confidence_intervals
                .clone()
                .unwrap_or_else(|| self.confidence_intervals.clone()),
            inflation_rate: overrides.inflation_rate.unwrap_or(self.inflation_rate),
            rebalance_frequency_months: overrides
                .rebalance_frequency_months
                .unwrap_or(self.rebalance_frequency_months),
            include_fees: overrides.include_fees.unwrap_or(self.include_fees),
            fee_structure: overrides.fee_structure.unwrap_or(self.fee_structure),
            var_alpha: overrides.var_alpha.unwrap_or(self.var_alpha),
            risk_free_rate: overrides.risk_free_rate.unwrap_or(self.risk_free_rate),
            success_target: overrides.success_target.or(self.success_target),
            success_criterion: overrides.success_criterion.unwrap_or(self.success_criterion),
            seed: overrides.seed.unwrap_or(self.seed),
            batch_size: self.batch_size,
            keep_paths: overrides.keep_paths.unwrap_or(self.keep_paths),
        }
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(PlannerError::validation(
                "config.version",
                format!("unsupported version {}, expected {CONFIG_VERSION}", self.version),
            ));
        }
        if self.num_simulations == 0 {
            return Err(PlannerError::validation("config.num_simulations", "must be > 0"));
        }
        if self.rebalance_frequency_months == 0 {
            return Err(PlannerError::validation(
                "config.rebalance_frequency_months",
                "must be > 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(PlannerError::validation("config.batch_size", "must be > 0"));
        }
        for (i, level) in self.confidence_intervals.iter().enumerate() {
            ensure_open_unit(*level, &format!("config.confidence_intervals[{i}]"))?;
            if self.confidence_intervals[..i].iter().any(|l| l == level) {
                return Err(PlannerError::validation(
                    format!("config.confidence_intervals[{i}]"),
                    format!("duplicate level {level}"),
                ));
            }
        }
        ensure_rate(self.inflation_rate, "config.inflation_rate")?;
        ensure_open_unit(self.var_alpha, "config.var_alpha")?;
        ensure_rate(self.risk_free_rate, "config.risk_free_rate")?;
        if let Some(target) = self.success_target {
            ensure_non_negative(target, "config.success_target")?;
        }
        self.fee_structure.validate()
    }

    /// Band levels widest first.
    pub fn sorted_levels(&self) -> Vec<f64> {
        let mut levels = self.confidence_intervals.clone();
        levels.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MonteCarloConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_simulations, 1000);
        assert_eq!(config.sorted_levels(), vec![0.95, 0.75, 0.5]);
    }

    #[test]
    fn test_merge_returns_new_instance() {
        let base = MonteCarloConfig::default();
        let merged = base.merge(&MonteCarloOverrides {
            num_simulations: Some(50),
            inflation_rate: Some(0.02),
            ..Default::default()
        });
        assert_eq!(merged.num_simulations, 50);
        assert_eq!(merged.inflation_rate, 0.02);
        assert_eq!(merged.rebalance_frequency_months, 12);
        assert_eq!(base.num_simulations, 1000);
    }

    #[test]
    fn test_rejects_bad_levels() {
        let mut config = MonteCarloConfig::default();
        config.confidence_intervals = vec![0.9, 1.0];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "config.confidence_intervals[1]"));

        config.confidence_intervals = vec![0.9, 0.9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MonteCarloConfig =
            serde_json::from_str(r#"{"num_simulations": 200, "include_fees": false}"#).unwrap();
        assert_eq!(config.num_simulations, 200);
        assert!(!config.include_fees);
        assert_eq!(config.fee_structure, FeeStructure::default());
        assert_eq!(config.version, CONFIG_VERSION);
    }
}
