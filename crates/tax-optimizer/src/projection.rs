//! Multi-year tax liability projection.
//!
//! Taxable holdings grow by price appreciation and pay distributions by
//! asset class. Distributions are reinvested and a share of the unrealised
//! gain is realised every year through turnover. Each year's income is split
//! into ordinary and preferentially taxed parts and priced with the caller's
//! rate schedule. Tax-deferred holdings compound untaxed; their embedded
//! liability is reported at the end of the horizon.

use planner_core::validation::{ensure_non_negative, ensure_probability, ensure_rate};
use planner_core::{AccountType, AssetClass, PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::models::{TaxConfig, TaxPortfolio};
use crate::tax_calculator::TaxRates;

pub const MAX_PROJECTION_YEARS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionAssumptions {
    pub years: u32,
    /// Wages and other ordinary income outside the portfolio, first year
    pub wage_income: f64,
    pub income_growth: f64,
    /// Annual price appreciation of equity-like holdings
    pub equity_growth: f64,
    /// Annual price appreciation of bonds and cash
    pub bond_growth: f64,
    /// Distribution yield of stocks and real estate
    pub dividend_yield: f64,
    /// Interest yield of bonds and cash
    pub interest_yield: f64,
    /// Share of stock dividends taxed at the long-term rate
    pub qualified_dividend_ratio: f64,
    /// Share of the unrealised gain realised each year
    pub turnover: f64,
    /// Share of realised gains that are short-term
    pub short_term_ratio: f64,
    /// Deduction applied to ordinary income first
    pub deduction: f64,
    /// Modified AGI above which NIIT is due; `None` defers to
    /// [`TaxRates::niit_applies`] every year
    pub niit_threshold: Option<f64>,
}

impl Default for ProjectionAssumptions {
    fn default() -> Self {
        Self {
            years: 10,
            wage_income: 0.0,
            income_growth: 0.03,
            equity_growth: 0.05,
            bond_growth: 0.0,
            dividend_yield: 0.02,
            interest_yield: 0.04,
            qualified_dividend_ratio: 0.8,
            turnover: 0.1,
            short_term_ratio: 0.2,
            deduction: 14_600.0,
            niit_threshold: Some(200_000.0),
        }
    }
}

impl ProjectionAssumptions {
    pub fn with_years(mut self, years: u32) -> Self {
        self.years = years;
        self
    }

    pub fn with_wage_income(mut self, wage_income: f64) -> Self {
        self.wage_income = wage_income;
        self
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.years == 0 || self.years > MAX_PROJECTION_YEARS {
            return Err(PlannerError::validation(
                "config.projection.years",
                format!("must lie in 1..={MAX_PROJECTION_YEARS}, got {}", self.years),
            ));
        }
        ensure_non_negative(self.wage_income, "config.projection.wage_income")?;
        ensure_rate(self.income_growth, "config.projection.income_growth")?;
        ensure_rate(self.equity_growth, "config.projection.equity_growth")?;
        ensure_rate(self.bond_growth, "config.projection.bond_growth")?;
        ensure_non_negative(self.dividend_yield, "config.projection.dividend_yield")?;
        ensure_non_negative(self.interest_yield, "config.projection.interest_yield")?;
        ensure_probability(
            self.qualified_dividend_ratio,
            "config.projection.qualified_dividend_ratio",
        )?;
        ensure_probability(self.turnover, "config.projection.turnover")?;
        ensure_probability(self.short_term_ratio, "config.projection.short_term_ratio")?;
        ensure_non_negative(self.deduction, "config.projection.deduction")?;
        if let Some(threshold) = self.niit_threshold {
            ensure_non_negative(threshold, "config.projection.niit_threshold")?;
        }
        Ok(())
    }

    fn price_growth(&self, class: AssetClass) -> f64 {
        match class {
            AssetClass::Bonds | AssetClass::Cash => self.bond_growth,
            _ => self.equity_growth,
        }
    }

    fn income_yield(&self, class: AssetClass) -> f64 {
        match class {
            AssetClass::Bonds | AssetClass::Cash => self.interest_yield,
            AssetClass::Stocks | AssetClass::RealEstate => self.dividend_yield,
            AssetClass::Commodities | AssetClass::Alternatives => 0.0,
        }
    }
}

/// One year of projected income and tax
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YearlyTaxLiability {
    /// 1 for the first projected year
    pub year: u32,
    /// Wages, interest, non-qualified dividends and short-term gains
    pub ordinary_income: f64,
    /// Qualified dividends and long-term gains
    pub preferential_income: f64,
    /// Portfolio income subject to NIIT
    pub investment_income: f64,
    pub ordinary_income_tax: f64,
    pub capital_gains_tax: f64,
    pub niit: f64,
    pub state_tax: f64,
    pub total_tax: f64,
    /// Total tax over gross income
    pub effective_rate: f64,
    pub taxable_value: f64,
    pub taxable_cost_basis: f64,
    pub tax_deferred_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxProjectionSummary {
    pub total_tax: f64,
    pub total_ordinary_income_tax: f64,
    pub total_capital_gains_tax: f64,
    pub total_niit: f64,
    pub total_state_tax: f64,
    pub average_annual_tax: f64,
    /// Total tax over total gross income across the horizon
    pub average_effective_rate: f64,
    /// First year with the highest total tax
    pub peak_year: u32,
    pub ending_taxable_value: f64,
    /// Gain still unrealised in taxable accounts at the end
    pub ending_unrealized_gain: f64,
    pub ending_tax_deferred_value: f64,
    /// Ordinary tax due if the tax-deferred balance were withdrawn at once
    pub deferred_tax_liability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxProjection {
    pub projections: Vec<YearlyTaxLiability>,
    pub summary: TaxProjectionSummary,
}

struct Holding {
    class: AssetClass,
    value: f64,
    basis: f64,
}

#[derive(Default)]
struct YearIncome {
    interest: f64,
    ordinary_dividends: f64,
    qualified_dividends: f64,
    short_term_gains: f64,
    long_term_gains: f64,
}

impl YearIncome {
    fn investment(&self) -> f64 {
        self.interest
            + self.ordinary_dividends
            + self.qualified_dividends
            + self.short_term_gains
            + self.long_term_gains
    }
}

/// Advance the taxable holdings one year and collect what they paid out.
fn grow_taxable(holdings: &mut [Holding], assumptions: &ProjectionAssumptions) -> YearIncome {
    let mut income = YearIncome::default();
    for holding in holdings.iter_mut() {
        let distribution = holding.value * assumptions.income_yield(holding.class);
        match holding.class {
            AssetClass::Bonds | AssetClass::Cash => income.interest += distribution,
            AssetClass::Stocks => {
                let qualified = distribution * assumptions.qualified_dividend_ratio;
                income.qualified_dividends += qualified;
                income.ordinary_dividends += distribution - qualified;
            }
            _ => income.ordinary_dividends += distribution,
        }
        holding.value = holding.value * (1.0 + assumptions.price_growth(holding.class)) + distribution;
        holding.basis += distribution;

        let realized = (holding.value - holding.basis).max(0.0) * assumptions.turnover;
        holding.basis += realized;
        let short_term = realized * assumptions.short_term_ratio;
        income.short_term_gains += short_term;
        income.long_term_gains += realized - short_term;
    }
    income
}

fn price_year(
    year: u32,
    wages: f64,
    income: &YearIncome,
    rates: &TaxRates,
    assumptions: &ProjectionAssumptions,
) -> YearlyTaxLiability {
    let ordinary_income =
        wages + income.interest + income.ordinary_dividends + income.short_term_gains;
    let preferential_income = income.qualified_dividends + income.long_term_gains;
    let gross_income = ordinary_income + preferential_income;
    let investment_income = income.investment();

    // the deduction reaches preferential income only once ordinary income is used up
    let taxable_ordinary = (ordinary_income - assumptions.deduction).max(0.0);
    let unused_deduction = (assumptions.deduction - ordinary_income).max(0.0);
    let taxable_preferential = (preferential_income - unused_deduction).max(0.0);

    let niit_base = match assumptions.niit_threshold {
        Some(threshold) => investment_income.min((gross_income - threshold).max(0.0)),
        None if rates.niit_applies => investment_income,
        None => 0.0,
    };

    let ordinary_income_tax = taxable_ordinary * rates.federal_ordinary;
    let capital_gains_tax = taxable_preferential * rates.federal_long_term;
    let niit = niit_base * rates.niit;
    let state_tax = (taxable_ordinary + taxable_preferential) * rates.state;
    let total_tax = ordinary_income_tax + capital_gains_tax + niit + state_tax;

    YearlyTaxLiability {
        year,
        ordinary_income,
        preferential_income,
        investment_income,
        ordinary_income_tax,
        capital_gains_tax,
        niit,
        state_tax,
        total_tax,
        effective_rate: if gross_income > 0.0 { total_tax / gross_income } else { 0.0 },
        taxable_value: 0.0,
        taxable_cost_basis: 0.0,
        tax_deferred_value: 0.0,
    }
}

fn total(projections: &[YearlyTaxLiability], field: impl Fn(&YearlyTaxLiability) -> f64) -> f64 {
    projections.iter().map(field).sum()
}

fn summarize(projections: &[YearlyTaxLiability], rates: &TaxRates) -> TaxProjectionSummary {
    let sum = |field: fn(&YearlyTaxLiability) -> f64| total(projections, field);
    let total_tax = sum(|y| y.total_tax);
    let gross_income = sum(|y| y.ordinary_income + y.preferential_income);
    let peak_year = projections
        .iter()
        .fold(None::<&YearlyTaxLiability>, |peak, y| match peak {
            Some(p) if p.total_tax >= y.total_tax => Some(p),
            _ => Some(y),
        })
        .map_or(0, |y| y.year);
    let (ending_taxable_value, ending_basis, ending_tax_deferred_value) = projections
        .last()
        .map_or((0.0, 0.0, 0.0), |y| {
            (y.taxable_value, y.taxable_cost_basis, y.tax_deferred_value)
        });

    TaxProjectionSummary {
        total_tax,
        total_ordinary_income_tax: sum(|y| y.ordinary_income_tax),
        total_capital_gains_tax: sum(|y| y.capital_gains_tax),
        total_niit: sum(|y| y.niit),
        total_state_tax: sum(|y| y.state_tax),
        average_annual_tax: total_tax / projections.len().max(1) as f64,
        average_effective_rate: if gross_income > 0.0 { total_tax / gross_income } else { 0.0 },
        peak_year,
        ending_taxable_value,
        ending_unrealized_gain: (ending_taxable_value - ending_basis).max(0.0),
        ending_tax_deferred_value,
        deferred_tax_liability: ending_tax_deferred_value * rates.ordinary_rate(),
    }
}

/// Year-by-year tax on the portfolio's income and realised gains plus the
/// investor's other ordinary income, with a horizon summary.
pub fn project_tax_liability(
    portfolio: &TaxPortfolio,
    rates: &TaxRates,
    config: &TaxConfig,
) -> PlannerResult<TaxProjection> {
    config.validate()?;
    rates.validate()?;
    portfolio.validate()?;
    let assumptions = &config.projection;

    let span = info_span!(
        "project_tax_liability",
        assets = portfolio.assets.len(),
        years = assumptions.years
    );
    let _guard = span.enter();

    let holdings_in = |account_type: AccountType| -> Vec<Holding> {
        portfolio
            .assets
            .iter()
            .filter(|a| a.account.unwrap_or(AccountType::Taxable) == account_type)
            .map(|a| Holding {
                class: a.asset_class,
                value: a.market_value,
                basis: a.cost_basis,
            })
            .collect()
    };
    let mut taxable = holdings_in(AccountType::Taxable);
    let mut deferred = holdings_in(AccountType::TaxDeferred);

    let mut projections = Vec::with_capacity(assumptions.years as usize);
    let mut wages = assumptions.wage_income;
    for year in 1..=assumptions.years {
        let income = grow_taxable(&mut taxable, assumptions);
        for holding in deferred.iter_mut() {
            holding.value *= 1.0
                + assumptions.price_growth(holding.class)
                + assumptions.income_yield(holding.class);
        }

        let mut liability = price_year(year, wages, &income, rates, assumptions);
        liability.taxable_value = taxable.iter().map(|h| h.value).sum();
        liability.taxable_cost_basis = taxable.iter().map(|h| h.basis).sum();
        liability.tax_deferred_value = deferred.iter().map(|h| h.value).sum();
        debug!(year, total_tax = liability.total_tax, "projected year");
        projections.push(liability);

        wages *= 1.0 + assumptions.income_growth;
    }

    let summary = summarize(&projections, rates);
    info!(
        years = assumptions.years,
        total_tax = summary.total_tax,
        peak_year = summary.peak_year,
        "tax liability projected"
    );
    Ok(TaxProjection {
        projections,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rates() -> TaxRates {
        TaxRates {
            federal_ordinary: 0.24,
            federal_long_term: 0.15,
            state: 0.05,
            niit: 0.038,
            niit_applies: false,
        }
    }

    fn flat() -> ProjectionAssumptions {
        ProjectionAssumptions {
            years: 1,
            wage_income: 0.0,
            income_growth: 0.0,
            equity_growth: 0.0,
            bond_growth: 0.0,
            dividend_yield: 0.0,
            interest_yield: 0.0,
            qualified_dividend_ratio: 1.0,
            turnover: 0.0,
            short_term_ratio: 0.0,
            deduction: 0.0,
            niit_threshold: None,
        }
    }

    #[test]
    fn test_deduction_spills_over_to_preferential_income() {
        let income = YearIncome {
            interest: 5_000.0,
            qualified_dividends: 20_000.0,
            ..Default::default()
        };
        let assumptions = ProjectionAssumptions {
            deduction: 10_000.0,
            ..flat()
        };
        let year = price_year(1, 0.0, &income, &rates(), &assumptions);
        assert_relative_eq!(year.ordinary_income_tax, 0.0);
        // 15000 of the dividends remain after the deduction
        assert_relative_eq!(year.capital_gains_tax, 2_250.0, epsilon = 1e-9);
        assert_relative_eq!(year.state_tax, 750.0, epsilon = 1e-9);
        assert_relative_eq!(year.effective_rate, 3_000.0 / 25_000.0, epsilon = 1e-12);
    }

    #[test]
    fn test_niit_limited_to_income_above_threshold() {
        let income = YearIncome {
            long_term_gains: 50_000.0,
            ..Default::default()
        };
        let assumptions = ProjectionAssumptions {
            niit_threshold: Some(200_000.0),
            ..flat()
        };
        let year = price_year(1, 180_000.0, &income, &rates(), &assumptions);
        assert_relative_eq!(year.niit, 30_000.0 * 0.038, epsilon = 1e-9);

        let year = price_year(1, 400_000.0, &income, &rates(), &assumptions);
        assert_relative_eq!(year.niit, 50_000.0 * 0.038, epsilon = 1e-9);

        let unconditional = ProjectionAssumptions {
            niit_threshold: None,
            ..flat()
        };
        let year = price_year(1, 0.0, &income, &TaxRates { niit_applies: true, ..rates() }, &unconditional);
        assert_relative_eq!(year.niit, 50_000.0 * 0.038, epsilon = 1e-9);
    }

    #[test]
    fn test_turnover_realises_share_of_gain() {
        let mut holdings = vec![Holding {
            class: AssetClass::Stocks,
            value: 100_000.0,
            basis: 60_000.0,
        }];
        let assumptions = ProjectionAssumptions {
            dividend_yield: 0.02,
            qualified_dividend_ratio: 0.5,
            turnover: 0.25,
            short_term_ratio: 0.2,
            ..flat()
        };
        let income = grow_taxable(&mut holdings, &assumptions);
        assert_relative_eq!(income.qualified_dividends, 1_000.0, epsilon = 1e-9);
        assert_relative_eq!(income.ordinary_dividends, 1_000.0, epsilon = 1e-9);
        // value 102000, basis 62000 before turnover
        assert_relative_eq!(income.short_term_gains, 2_000.0, epsilon = 1e-9);
        assert_relative_eq!(income.long_term_gains, 8_000.0, epsilon = 1e-9);
        assert_relative_eq!(holdings[0].basis, 72_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_years_bounded() {
        assert!(ProjectionAssumptions::default().validate().is_ok());
        let err = ProjectionAssumptions::default().with_years(0).validate().unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "config.projection.years"));
        assert!(ProjectionAssumptions::default().with_years(51).validate().is_err());
    }
}
