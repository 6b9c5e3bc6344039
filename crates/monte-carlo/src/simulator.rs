use nalgebra::DVector;
use planner_core::validation::{ensure_finite, ensure_non_negative};
use planner_core::{validate_allocation, Allocation, CancellationToken, PlannerError, PlannerResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stats_kernel::stats::{self, JarqueBera};
use tracing::{debug, info, info_span};

use crate::config::{MonteCarloConfig, SuccessCriterion};
use crate::generator::{CorrelatedReturnGenerator, ReturnAssumptions};

/// Scenario inputs for one projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationInput {
    pub initial_investment: f64,
    pub monthly_contribution: f64,
    pub horizon_years: u32,
    /// Target weights, keyed by the symbols of `return_assumptions`
    pub allocation: Allocation,
    pub return_assumptions: ReturnAssumptions,
}

impl SimulationInput {
    pub fn months(&self) -> usize {
        self.horizon_years as usize * 12
    }

    pub fn validate(&self) -> PlannerResult<()> {
        ensure_non_negative(self.initial_investment, "initial_investment")?;
        ensure_finite(self.monthly_contribution, "monthly_contribution")?;
        if self.horizon_years == 0 {
            return Err(PlannerError::InsufficientData(
                "horizon_years must cover at least one year".to_string(),
            ));
        }
        self.return_assumptions.validate()?;
        validate_allocation(&self.allocation, "allocation")?;
        let symbols = self.return_assumptions.symbols();
        for symbol in self.allocation.keys() {
            if !symbols.contains(&symbol.as_str()) {
                return Err(PlannerError::validation(
                    format!("allocation[{symbol}]"),
                    "no return assumption for this asset",
                ));
            }
        }
        Ok(())
    }

    /// Target weights in the row order of the return assumptions.
    fn target_weights(&self) -> DVector<f64> {
        let assets = &self.return_assumptions.assets;
        DVector::from_fn(assets.len(), |i, _| {
            self.allocation.get(&assets[i].symbol).copied().unwrap_or(0.0)
        })
    }

    /// Initial investment plus every inflation-adjusted contribution.
    pub fn total_contributions(&self, inflation_rate: f64) -> f64 {
        self.initial_investment
            + (1..=self.months())
                .map(|m| contribution_for_month(self.monthly_contribution, inflation_rate, m))
                .sum::<f64>()
    }
}

fn contribution_for_month(monthly: f64, inflation_rate: f64, month: usize) -> f64 {
    monthly * (1.0 + inflation_rate).powf(month as f64 / 12.0)
}

/// Portfolio value at month 0..=months of one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPath {
    pub trial: usize,
    pub values: Vec<f64>,
}

impl SimulationPath {
    /// `(month, value)` pairs in month order.
    pub fn points(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values.iter().copied().enumerate()
    }

    pub fn terminal_value(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    pub fn max_value(&self) -> f64 {
        self.values.iter().copied().fold(f64::MIN, f64::max)
    }

    /// Values at each year boundary, year 0 first.
    pub fn annual_snapshots(&self) -> Vec<f64> {
        self.values.iter().step_by(12).copied().collect()
    }

    pub fn max_drawdown(&self) -> f64 {
        stats::max_drawdown(&self.values).unwrap_or(0.0)
    }

    /// Investment return of each month with that month's contribution
    /// taken out. Months starting from an empty account are skipped.
    pub fn monthly_returns(&self, contributions: &[f64]) -> Vec<f64> {
        self.values
            .windows(2)
            .zip(contributions)
            .filter(|(pair, _)| pair[0] > 0.0)
            .map(|(pair, contribution)| (pair[1] - contribution) / pair[0] - 1.0)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Cross-trial statistics at one year boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearStatistics {
    pub year: u32,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub confidence_bands: Vec<ConfidenceBand>,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Deepest drawdown seen in any trial
    pub worst_max_drawdown: f64,
    pub median_max_drawdown: f64,
    /// Median of (terminal / total contributions)^(1/years) - 1
    pub median_annualized_return: f64,
    /// Share of trials ending below the total amount contributed
    pub probability_of_loss: f64,
    /// Dispersion of the annualised return across trials
    pub outcome_volatility: f64,
    /// Median across trials of the annualised Sharpe ratio of monthly
    /// returns; `None` when no trial has any return dispersion
    pub median_sharpe_ratio: Option<f64>,
    pub median_sortino_ratio: Option<f64>,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub skewness: f64,
    pub excess_kurtosis: f64,
    pub jarque_bera: JarqueBera,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallStatistics {
    pub mean_terminal_value: f64,
    pub median_terminal_value: f64,
    pub best_terminal_value: f64,
    pub worst_terminal_value: f64,
    pub total_contributions: f64,
    /// Fraction of trials meeting `success_target`, when one was configured
    pub success_rate: Option<f64>,
    pub risk: RiskMetrics,
    pub distribution: DistributionMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloOutput {
    pub num_simulations: usize,
    pub months: usize,
    /// Monthly paths; empty when `keep_paths` is off
    pub paths: Vec<SimulationPath>,
    /// One entry per year 1..=horizon
    pub annual: Vec<YearStatistics>,
    pub overall: OverallStatistics,
    /// The correlation matrix was replaced by its nearest PSD matrix
    pub correlation_corrected: bool,
    #[serde(skip)]
    terminal_values: Vec<f64>,
    #[serde(skip)]
    path_maxima: Vec<f64>,
}

impl MonteCarloOutput {
    /// Fraction of trials in [0, 1] whose value meets or exceeds `target`.
    pub fn success_rate(&self, target: f64, criterion: SuccessCriterion) -> f64 {
        success_fraction(&self.terminal_values, &self.path_maxima, target, criterion)
    }

    pub fn terminal_values(&self) -> &[f64] {
        &self.terminal_values
    }
}

fn success_fraction(
    terminal: &[f64],
    maxima: &[f64],
    target: f64,
    criterion: SuccessCriterion,
) -> f64 {
    let values = match criterion {
        SuccessCriterion::TerminalValue => terminal,
        SuccessCriterion::AnyPointMaximum => maxima,
    };
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|v| **v >= target).count() as f64 / values.len() as f64
}

/// Runs independent trials of the monthly contribution / fee / rebalance
/// cycle and aggregates the outcome distribution.
pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> PlannerResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    pub fn run(
        &self,
        input: &SimulationInput,
        cancel: &CancellationToken,
    ) -> PlannerResult<MonteCarloOutput> {
        input.validate()?;
        let span = info_span!(
            "monte_carlo",
            trials = self.config.num_simulations,
            months = input.months(),
            assets = input.return_assumptions.assets.len()
        );
        let _guard = span.enter();

        let generator = CorrelatedReturnGenerator::new(&input.return_assumptions)?;
        let weights = input.target_weights();
        let trials = self.config.num_simulations;
        let batch = self.config.batch_size;

        let mut paths: Vec<SimulationPath> = Vec::with_capacity(trials);
        let mut start = 0;
        while start < trials {
            cancel.check()?;
            let end = (start + batch).min(trials);
            let chunk: Vec<SimulationPath> = (start..end)
                .into_par_iter()
                .map(|trial| self.run_trial(&generator, input, &weights, trial))
                .collect();
            paths.extend(chunk);
            debug!(completed = end, "trial batch finished");
            start = end;
        }
        cancel.check()?;

        let output = self.aggregate(input, paths, generator.corrected())?;
        info!(
            median_terminal = output.overall.median_terminal_value,
            worst_drawdown = output.overall.risk.worst_max_drawdown,
            "monte carlo complete"
        );
        Ok(output)
    }

    fn run_trial(
        &self,
        generator: &CorrelatedReturnGenerator,
        input: &SimulationInput,
        weights: &DVector<f64>,
        trial: usize,
    ) -> SimulationPath {
        let config = &self.config;
        let months = input.months();
        let returns = generator.trial_returns(config.seed, trial as u64, months);
        let asset_fee = if config.include_fees {
            config.fee_structure.monthly_asset_fee()
        } else {
            0.0
        };
        let trading_cost = if config.include_fees {
            config.fee_structure.trading_costs
        } else {
            0.0
        };
        let frequency = config.rebalance_frequency_months as usize;

        let mut value = input.initial_investment;
        let mut holdings: DVector<f64> = weights * value;
        let mut values = Vec::with_capacity(months + 1);
        values.push(value);

        for (idx, month_returns) in returns.iter().enumerate() {
            let month = idx + 1;

            // fees come off before growth
            if value > 0.0 && asset_fee > 0.0 {
                holdings *= 1.0 - asset_fee;
            }
            holdings.component_mul_assign(&month_returns.map(|r| 1.0 + r));

            let contribution =
                contribution_for_month(input.monthly_contribution, config.inflation_rate, month);
            holdings += weights * contribution;

            value = holdings.sum();
            if value <= 0.0 {
                value = 0.0;
                holdings.fill(0.0);
            }

            if month % frequency == 0 && value > 0.0 {
                let target: DVector<f64> = weights * value;
                let traded: f64 = (&holdings - &target).abs().sum();
                value = (value - trading_cost * traded).max(0.0);
                holdings = weights * value;
            }

            values.push(value);
        }

        SimulationPath { trial, values }
    }

    fn aggregate(
        &self,
        input: &SimulationInput,
        paths: Vec<SimulationPath>,
        corrected: bool,
    ) -> PlannerResult<MonteCarloOutput> {
        let config = &self.config;
        let years = input.horizon_years;
        let levels = config.sorted_levels();

        let annual = (1..=years)
            .into_par_iter()
            .map(|year| {
                let snapshot: Vec<f64> = paths.iter().map(|p| p.values[year as usize * 12]).collect();
                year_statistics(year, &snapshot, &levels, config.var_alpha)
            })
            .collect::<PlannerResult<Vec<_>>>()?;

        let terminal_values: Vec<f64> = paths.iter().map(SimulationPath::terminal_value).collect();
        let path_maxima: Vec<f64> = paths.iter().map(SimulationPath::max_value).collect();
        let drawdowns: Vec<f64> = paths.iter().map(SimulationPath::max_drawdown).collect();
        let total_contributions = input.total_contributions(config.inflation_rate);

        let annualized: Vec<f64> = terminal_values
            .iter()
            .map(|v| {
                if total_contributions > 0.0 {
                    (v / total_contributions).powf(1.0 / years as f64) - 1.0
                } else {
                    0.0
                }
            })
            .collect();
        let losses = terminal_values
            .iter()
            .filter(|v| **v < total_contributions)
            .count();

        let contributions: Vec<f64> = (1..=input.months())
            .map(|m| contribution_for_month(input.monthly_contribution, config.inflation_rate, m))
            .collect();
        let (sharpes, sortinos): (Vec<Option<f64>>, Vec<Option<f64>>) = paths
            .par_iter()
            .map(|path| {
                let returns = path.monthly_returns(&contributions);
                (
                    stats::sharpe_ratio(&returns, config.risk_free_rate, 12.0),
                    stats::sortino_ratio(&returns, config.risk_free_rate, 12.0),
                )
            })
            .unzip();

        let summary = stats::summarize(&terminal_values)?;
        let risk = RiskMetrics {
            worst_max_drawdown: drawdowns.iter().copied().fold(0.0, f64::max),
            median_max_drawdown: stats::median(&drawdowns)?,
            median_annualized_return: stats::median(&annualized)?,
            probability_of_loss: losses as f64 / terminal_values.len() as f64,
            outcome_volatility: stats::population_std(&annualized)?,
            median_sharpe_ratio: median_of_defined(&sharpes)?,
            median_sortino_ratio: median_of_defined(&sortinos)?,
            value_at_risk: stats::value_at_risk(&terminal_values, config.var_alpha)?,
            conditional_value_at_risk: stats::conditional_value_at_risk(
                &terminal_values,
                config.var_alpha,
            )?,
        };
        let distribution = DistributionMetrics {
            skewness: stats::skewness(&terminal_values)?,
            excess_kurtosis: stats::excess_kurtosis(&terminal_values)?,
            jarque_bera: stats::jarque_bera(&terminal_values)?,
        };
        let success_rate = config.success_target.map(|target| {
            success_fraction(&terminal_values, &path_maxima, target, config.success_criterion)
        });

        Ok(MonteCarloOutput {
            num_simulations: paths.len(),
            months: input.months(),
            paths: if config.keep_paths { paths } else { Vec::new() },
            annual,
            overall: OverallStatistics {
                mean_terminal_value: summary.mean,
                median_terminal_value: summary.median,
                best_terminal_value: summary.max,
                worst_terminal_value: summary.min,
                total_contributions,
                success_rate,
                risk,
                distribution,
            },
            correlation_corrected: corrected,
            terminal_values,
            path_maxima,
        })
    }
}

fn median_of_defined(values: &[Option<f64>]) -> PlannerResult<Option<f64>> {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    if defined.is_empty() {
        return Ok(None);
    }
    stats::median(&defined).map(Some)
}

fn year_statistics(
    year: u32,
    values: &[f64],
    levels: &[f64],
    alpha: f64,
) -> PlannerResult<YearStatistics> {
    let sorted = stats::sorted(values);
    let confidence_bands = levels
        .iter()
        .map(|&level| {
            let (lower, upper) = stats::confidence_band_sorted(&sorted, level)?;
            Ok(ConfidenceBand { level, lower, upper })
        })
        .collect::<PlannerResult<Vec<_>>>()?;
    Ok(YearStatistics {
        year,
        mean: stats::mean(&sorted)?,
        median: stats::percentile_sorted(&sorted, 0.5)?,
        std_dev: stats::population_std(&sorted)?,
        confidence_bands,
        value_at_risk: stats::percentile_sorted(&sorted, alpha)?,
        conditional_value_at_risk: stats::conditional_value_at_risk(&sorted, alpha)?,
    })
}

/// Run a projection with the given config.
pub fn run_monte_carlo(
    input: &SimulationInput,
    config: &MonteCarloConfig,
    cancel: &CancellationToken,
) -> PlannerResult<MonteCarloOutput> {
    MonteCarloSimulator::new(config.clone())?.run(input, cancel)
}
