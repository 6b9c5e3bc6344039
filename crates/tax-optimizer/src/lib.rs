//! Tax Strategy Optimizer
//!
//! Tax-aware planning over one portfolio snapshot:
//! - Asset location across taxable, tax-deferred and tax-exempt accounts
//! - Tax-loss harvesting with substitutes and wash-sale checks
//! - Withdrawal sequencing
//! - A combined efficiency score and projected savings
//! - A multi-year projection of the tax the portfolio generates
//!
//! The strategy is evaluated against the `as_of` date in [`TaxConfig`].

pub mod asset_location;
pub mod harvester;
pub mod hungarian;
pub mod models;
pub mod projection;
pub mod strategy;
pub mod substitutes;
pub mod tax_calculator;
pub mod wash_sale;
pub mod withdrawal;
#[cfg(test)]
mod tests;

pub use asset_location::{AccountScores, AssetLocation, LocationScores, Placement};
pub use harvester::{HarvestOpportunity, HarvestPriority, HarvestSummary, HarvestingConfig, HarvestingEngine};
pub use models::*;
pub use projection::{
    project_tax_liability, ProjectionAssumptions, TaxProjection, TaxProjectionSummary,
    YearlyTaxLiability,
};
pub use strategy::compute_tax_strategy;
pub use substitutes::{Security, SubstituteConfig, SubstituteFinder, SubstituteSecurity};
pub use tax_calculator::{GainType, HoldingPeriod, TaxCalculator, TaxLot, TaxRates, TaxRules};
pub use wash_sale::{TradeRecord, TradeSide, WashSaleMonitor, WashSaleWindow};
pub use withdrawal::{WithdrawalPlan, WithdrawalPreferences, WithdrawalStep};
