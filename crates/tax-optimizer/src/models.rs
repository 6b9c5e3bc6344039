use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use planner_core::validation::ensure_non_negative;
use planner_core::{validate_assets, AccountType, Asset, PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};

use crate::asset_location::{AssetLocation, LocationScores};
use crate::harvester::{HarvestOpportunity, HarvestSummary, HarvestingConfig};
use crate::projection::ProjectionAssumptions;
use crate::substitutes::{Security, SubstituteConfig};
use crate::tax_calculator::{TaxLot, TaxRules};
use crate::wash_sale::TradeRecord;
use crate::withdrawal::{WithdrawalPlan, WithdrawalPreferences};

pub const CONFIG_VERSION: u32 = 1;

/// An investment account and what it holds in cash terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub account_type: AccountType,
    /// Current balance, also the account's capacity for asset location
    pub balance: f64,
    /// Basis of a taxable account; the rest of a withdrawal is gain
    #[serde(default)]
    pub cost_basis: f64,
    /// Required minimum distribution due this year
    #[serde(default)]
    pub required_minimum_distribution: f64,
}

impl Account {
    pub fn new(id: impl Into<String>, account_type: AccountType, balance: f64) -> Self {
        Self {
            id: id.into(),
            account_type,
            balance,
            cost_basis: 0.0,
            required_minimum_distribution: 0.0,
        }
    }

    pub fn with_cost_basis(mut self, cost_basis: f64) -> Self {
        self.cost_basis = cost_basis;
        self
    }

    pub fn with_rmd(mut self, amount: f64) -> Self {
        self.required_minimum_distribution = amount;
        self
    }

    /// Share of a taxable withdrawal that is realised gain
    pub fn gain_fraction(&self) -> f64 {
        if self.balance > 0.0 {
            (1.0 - self.cost_basis / self.balance).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn validate(&self, index: usize) -> PlannerResult<()> {
        let field = |name: &str| format!("accounts[{index}].{name}");
        if self.id.trim().is_empty() {
            return Err(PlannerError::validation(field("id"), "must not be empty"));
        }
        ensure_non_negative(self.balance, &field("balance"))?;
        ensure_non_negative(self.cost_basis, &field("cost_basis"))?;
        ensure_non_negative(
            self.required_minimum_distribution,
            &field("required_minimum_distribution"),
        )
    }
}

/// Holdings, accounts and trading history for a tax strategy run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxPortfolio {
    pub assets: Vec<Asset>,
    /// Open lots; positions without lots are evaluated on their totals
    pub lots: Vec<TaxLot>,
    /// Accounts; derived from the assets' current accounts when empty
    pub accounts: Vec<Account>,
    /// Securities available as harvesting substitutes
    pub universe: Vec<Security>,
    pub recent_trades: Vec<TradeRecord>,
    /// Cash the investor needs to withdraw this year
    pub withdrawal_needs: f64,
}

impl TaxPortfolio {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self {
            assets,
            ..Default::default()
        }
    }

    pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn with_lots(mut self, lots: Vec<TaxLot>) -> Self {
        self.lots = lots;
        self
    }

    pub fn with_trades(mut self, trades: Vec<TradeRecord>) -> Self {
        self.recent_trades = trades;
        self
    }

    pub fn with_universe(mut self, universe: Vec<Security>) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_withdrawal(mut self, amount: f64) -> Self {
        self.withdrawal_needs = amount;
        self
    }

    /// The caller's accounts, or one per account type the assets are held in
    pub fn effective_accounts(&self) -> Vec<Account> {
        if !self.accounts.is_empty() {
            return self.accounts.clone();
        }
        let mut grouped: BTreeMap<AccountType, Account> = BTreeMap::new();
        for asset in &self.assets {
            let account_type = asset.account.unwrap_or(AccountType::Taxable);
            let account = grouped
                .entry(account_type)
                .or_insert_with(|| Account::new(account_key(account_type), account_type, 0.0));
            account.balance += asset.market_value;
            if account_type == AccountType::Taxable {
                account.cost_basis += asset.cost_basis;
            }
        }
        grouped.into_values().collect()
    }

    pub fn validate(&self) -> PlannerResult<()> {
        validate_assets(&self.assets)?;
        for (i, lot) in self.lots.iter().enumerate() {
            lot.validate(i)?;
        }
        let mut ids = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            account.validate(i)?;
            if !ids.insert(account.id.as_str()) {
                return Err(PlannerError::validation(
                    format!("accounts[{i}].id"),
                    format!("duplicate account {}", account.id),
                ));
            }
        }
        ensure_non_negative(self.withdrawal_needs, "withdrawal_needs")
    }
}

fn account_key(account_type: AccountType) -> &'static str {
    match account_type {
        AccountType::Taxable => "taxable",
        AccountType::TaxDeferred => "tax_deferred",
        AccountType::TaxExempt => "tax_exempt",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxConfig {
    pub version: u32,
    /// Evaluation date for holding periods and wash-sale windows
    pub as_of: Option<NaiveDate>,
    pub rules: TaxRules,
    pub harvesting: HarvestingConfig,
    pub substitutes: SubstituteConfig,
    pub location_scores: LocationScores,
    pub withdrawal: WithdrawalPreferences,
    /// Growth and income assumptions for the multi-year projection
    pub projection: ProjectionAssumptions,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            as_of: None,
            rules: TaxRules::default(),
            harvesting: HarvestingConfig::default(),
            substitutes: SubstituteConfig::default(),
            location_scores: LocationScores::default(),
            withdrawal: WithdrawalPreferences::default(),
            projection: ProjectionAssumptions::default(),
        }
    }
}

/// Partial update applied by [`TaxConfig::merge`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxOverrides {
    pub as_of: Option<NaiveDate>,
    pub harvest_threshold: Option<f64>,
    pub wash_sale_window_days: Option<u32>,
    pub location_scores: Option<LocationScores>,
    pub withdrawal: Option<WithdrawalPreferences>,
    pub projection: Option<ProjectionAssumptions>,
}

impl TaxConfig {
    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_harvest_threshold(mut self, threshold: f64) -> Self {
        self.harvesting.min_loss_threshold = threshold;
        self
    }

    pub fn with_wash_sale_window(mut self, days: u32) -> Self {
        self.rules.wash_sale_window_days = days;
        self
    }

    /// New config with every set override applied.
    pub fn merge(&self, overrides: &TaxOverrides) -> Self {
        let mut rules = self.rules;
        if let Some(days) = overrides.wash_sale_window_days {
            rules.wash_sale_window_days = days;
        }
        let mut harvesting = self.harvesting.clone();
        if let Some(threshold) = overrides.harvest_threshold {
            harvesting.min_loss_threshold = threshold;
        }
        Self {
            version: self.version,
            as_of: overrides.as_of.or(self.as_of),
            rules,
            harvesting,
            substitutes: self.substitutes,
            location_scores: overrides
                .location_scores
                .unwrap_or(self.location_scores),
            withdrawal: overrides.withdrawal.unwrap_or(self.withdrawal),
            projection: overrides.projection.unwrap_or(self.projection),
        }
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(PlannerError::validation(
                "config.version",
                format!("unsupported version {}, expected {CONFIG_VERSION}", self.version),
            ));
        }
        self.harvesting.validate()?;
        self.substitutes.validate()?;
        self.location_scores.validate()?;
        self.projection.validate()
    }

    /// The evaluation date; there is no wall-clock fallback.
    pub fn evaluation_date(&self) -> PlannerResult<NaiveDate> {
        self.as_of
            .ok_or_else(|| PlannerError::validation("config.as_of", "an evaluation date is required"))
    }
}

/// Component scores in [0, 1] and their weighted combination
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxEfficiency {
    pub asset_location: f64,
    pub harvesting: f64,
    pub withdrawal: f64,
    pub overall: f64,
}

/// Estimated tax avoided by following the strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSavings {
    pub harvesting: f64,
    pub location: f64,
    pub withdrawal: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxStrategy {
    pub as_of: NaiveDate,
    pub asset_location: AssetLocation,
    pub harvesting_opportunities: Vec<HarvestOpportunity>,
    pub harvest_summary: HarvestSummary,
    pub withdrawal_strategy: WithdrawalPlan,
    pub efficiency: TaxEfficiency,
    pub projected_savings: ProjectedSavings,
}
