use std::collections::BTreeMap;

use planner_core::validation::{
    ensure_finite, ensure_non_negative, ensure_open_unit, ensure_positive, ensure_probability,
};
use planner_core::{validate_assets, Allocation, Asset, MarketView, PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

/// Where the covariance matrix comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceSource {
    /// Asset volatilities combined with the supplied correlation matrix
    #[default]
    Assumed,
    /// Sample covariance of each asset's `historical_returns`
    Historical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub version: u32,
    pub use_black_litterman: bool,
    pub use_cvar: bool,
    pub use_resampling: bool,
    pub num_resamples: usize,
    /// Observations per resampled estimation window; defaults to max(60, 2n)
    pub resample_observations: Option<usize>,
    pub risk_free_rate: f64,
    /// δ in the mean-variance utility and the equilibrium return formula
    pub risk_aversion: f64,
    /// Black-Litterman prior uncertainty scalar
    pub tau: f64,
    pub covariance_source: CovarianceSource,
    /// Used to annualise historical return series
    pub periods_per_year: f64,
    /// Off-diagonal shrinkage towards zero covariance, in [0, 1]
    pub shrinkage: f64,
    /// Simulated scenarios for the CVaR budget when no history is used
    pub cvar_scenarios: usize,
    pub seed: u64,
    pub max_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            use_black_litterman: false,
            use_cvar: false,
            use_resampling: false,
            num_resamples: 1000,
            resample_observations: None,
            risk_free_rate: 0.02,
            risk_aversion: 3.0,
            tau: 0.025,
            covariance_source: CovarianceSource::Assumed,
            periods_per_year: 12.0,
            shrinkage: 0.0,
            cvar_scenarios: 2000,
            seed: 0x0B7_1A1,
            max_iterations: 500,
        }
    }
}

/// Partial update applied by [`OptimizerConfig::merge`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOverrides {
    pub use_black_litterman: Option<bool>,
    pub use_cvar: Option<bool>,
    pub use_resampling: Option<bool>,
    pub num_resamples: Option<usize>,
    pub risk_free_rate: Option<f64>,
    pub risk_aversion: Option<f64>,
    pub tau: Option<f64>,
    pub covariance_source: Option<CovarianceSource>,
    pub shrinkage: Option<f64>,
    pub seed: Option<u64>,
}

impl OptimizerConfig {
    pub fn with_black_litterman(mut self, enabled: bool) -> Self {
        self.use_black_litterman = enabled;
        self
    }

    pub fn with_cvar(mut self, enabled: bool) -> Self {
        self.use_cvar = enabled;
        self
    }

    pub fn with_resampling(mut self, num_resamples: usize) -> Self {
        self.use_resampling = true;
        self.num_resamples = num_resamples;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn merge(&self, overrides: &OptimizerOverrides) -> Self {
        Self {
            use_black_litterman: overrides
                .use_black_litterman
                .unwrap_or(self.use_black_litterman),
            use_cvar: overrides.use_cvar.unwrap_or(self.use_cvar),
            use_resampling: overrides.use_resampling.unwrap_or(self.use_resampling),
            num_resamples: overrides.num_resamples.unwrap_or(self.num_resamples),
            risk_free_rate: overrides.risk_free_rate.unwrap_or(self.risk_free_rate),
            risk_aversion: overrides.risk_aversion.unwrap_or(self.risk_aversion),
            tau: overrides.tau.unwrap_or(self.tau),
            covariance_source: overrides.covariance_source.unwrap_or(self.covariance_source),
            shrinkage: overrides.shrinkage.unwrap_or(self.shrinkage),
            seed: overrides.seed.unwrap_or(self.seed),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(PlannerError::validation(
                "config.version",
                format!("unsupported version {}, expected {CONFIG_VERSION}", self.version),
            ));
        }
        if self.use_resampling && self.num_resamples == 0 {
            return Err(PlannerError::validation("config.num_resamples", "must be > 0"));
        }
        if let Some(t) = self.resample_observations {
            if t < 2 {
                return Err(PlannerError::validation(
                    "config.resample_observations",
                    "must be >= 2",
                ));
            }
        }
        ensure_finite(self.risk_free_rate, "config.risk_free_rate")?;
        ensure_positive(self.risk_aversion, "config.risk_aversion")?;
        ensure_positive(self.tau, "config.tau")?;
        ensure_positive(self.periods_per_year, "config.periods_per_year")?;
        ensure_probability(self.shrinkage, "config.shrinkage")?;
        if self.use_cvar && self.cvar_scenarios < 20 {
            return Err(PlannerError::validation("config.cvar_scenarios", "must be >= 20"));
        }
        if self.max_iterations == 0 {
            return Err(PlannerError::validation("config.max_iterations", "must be > 0"));
        }
        Ok(())
    }
}

/// CVaR budget: expected loss in the worst `alpha` tail must not exceed `max_cvar`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvarBudget {
    #[serde(default = "default_cvar_alpha")]
    pub alpha: f64,
    /// Maximum tail loss as a positive return fraction (0.15 = lose 15%)
    pub max_cvar: f64,
}

fn default_cvar_alpha() -> f64 {
    0.05
}

/// Linear and risk constraints on the allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConstraints {
    /// Lower bound for assets without an entry in `min_weights`
    pub default_min_weight: f64,
    /// Upper bound for assets without an entry in `max_weights`
    pub default_max_weight: f64,
    pub min_weights: BTreeMap<String, f64>,
    pub max_weights: BTreeMap<String, f64>,
    /// Maximum combined weight per sector
    pub sector_caps: BTreeMap<String, f64>,
    pub target_return: Option<f64>,
    pub max_volatility: Option<f64>,
    pub cvar: Option<CvarBudget>,
}

impl Default for OptimizationConstraints {
    fn default() -> Self {
        Self {
            default_min_weight: 0.0,
            default_max_weight: 1.0,
            min_weights: BTreeMap::new(),
            max_weights: BTreeMap::new(),
            sector_caps: BTreeMap::new(),
            target_return: None,
            max_volatility: None,
            cvar: None,
        }
    }
}

impl OptimizationConstraints {
    pub fn min_weight(&self, symbol: &str) -> f64 {
        self.min_weights
            .get(symbol)
            .copied()
            .unwrap_or(self.default_min_weight)
    }

    pub fn max_weight(&self, symbol: &str) -> f64 {
        self.max_weights
            .get(symbol)
            .copied()
            .unwrap_or(self.default_max_weight)
    }

    pub fn validate(&self, symbols: &[&str]) -> PlannerResult<()> {
        ensure_probability(self.default_min_weight, "constraints.default_min_weight")?;
        ensure_probability(self.default_max_weight, "constraints.default_max_weight")?;
        for (map, name) in [(&self.min_weights, "min_weights"), (&self.max_weights, "max_weights")] {
            for (symbol, w) in map {
                let field = format!("constraints.{name}[{symbol}]");
                if !symbols.contains(&symbol.as_str()) {
                    return Err(PlannerError::validation(field, "unknown asset"));
                }
                ensure_probability(*w, &field)?;
            }
        }
        for (sector, cap) in &self.sector_caps {
            ensure_probability(*cap, &format!("constraints.sector_caps[{sector}]"))?;
        }
        if let Some(t) = self.target_return {
            ensure_finite(t, "constraints.target_return")?;
        }
        if let Some(v) = self.max_volatility {
            ensure_positive(v, "constraints.max_volatility")?;
        }
        if let Some(budget) = &self.cvar {
            ensure_open_unit(budget.alpha, "constraints.cvar.alpha")?;
            ensure_finite(budget.max_cvar, "constraints.cvar.max_cvar")?;
        }
        Ok(())
    }
}

/// Everything `optimize()` needs about the investable universe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationInput {
    pub assets: Vec<Asset>,
    /// Correlation matrix in asset order; identity when omitted
    #[serde(default)]
    pub correlation: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub constraints: OptimizationConstraints,
    #[serde(default)]
    pub market_views: Vec<MarketView>,
    /// Allocation to rebalance from; derived from market values when omitted
    #[serde(default)]
    pub current_allocation: Option<Allocation>,
}

impl OptimizationInput {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self {
            assets,
            correlation: None,
            constraints: OptimizationConstraints::default(),
            market_views: Vec::new(),
            current_allocation: None,
        }
    }

    pub fn with_correlation(mut self, correlation: Vec<Vec<f64>>) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_constraints(mut self, constraints: OptimizationConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_views(mut self, views: Vec<MarketView>) -> Self {
        self.market_views = views;
        self
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.assets.iter().map(|a| a.symbol.as_str()).collect()
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.assets.is_empty() {
            return Err(PlannerError::InsufficientData("no assets to optimise".to_string()));
        }
        validate_assets(&self.assets)?;
        let symbols = self.symbols();
        self.constraints.validate(&symbols)?;
        for (i, view) in self.market_views.iter().enumerate() {
            view.validate(i, &symbols)?;
        }
        if let Some(current) = &self.current_allocation {
            for (symbol, w) in current {
                ensure_non_negative(*w, &format!("current_allocation[{symbol}]"))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceTrade {
    pub symbol: String,
    pub direction: TradeDirection,
    /// Absolute weight change
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingPlan {
    pub trades: Vec<RebalanceTrade>,
    pub total_turnover: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Inverse Herfindahl index of the weights (effective number of holdings)
    pub diversification_score: f64,
    pub herfindahl_index: f64,
    /// Σ wᵢσᵢ / σₚ
    pub diversification_ratio: f64,
    /// Share of portfolio variance from each asset; sums to 1
    pub risk_contributions: BTreeMap<String, f64>,
    /// Parametric one-year 95% VaR as a positive loss fraction
    pub value_at_risk_95: f64,
    pub conditional_value_at_risk_95: f64,
    pub sector_exposure: BTreeMap<String, f64>,
    pub equilibrium_returns: Option<BTreeMap<String, f64>>,
    pub posterior_returns: Option<BTreeMap<String, f64>>,
    /// Successful resampling draws, when resampling ran
    pub resamples_used: Option<usize>,
    /// Cutting planes added for the CVaR budget
    pub cvar_cuts: Option<usize>,
    pub covariance_corrected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub allocation: Allocation,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub diagnostics: Diagnostics,
    pub rebalancing: Option<RebalancingPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub risk: f64,
    pub expected_return: f64,
    pub weights: Allocation,
    pub sharpe_ratio: f64,
}
