//! Withdrawal sequencing.
//!
//! Accounts are drawn in tax-efficiency order: taxable principal first,
//! tax-deferred next, tax-exempt last. Required minimum distributions can
//! be taken up front, and a tier can be drawn pro rata instead of one
//! account at a time.

use planner_core::validation::ensure_non_negative;
use planner_core::{AccountType, PlannerResult};
use serde::{Deserialize, Serialize};

use crate::models::Account;
use crate::tax_calculator::TaxRates;

/// Preferred order: lowest tax cost today first
pub const EFFICIENT_ORDER: [AccountType; 3] = [
    AccountType::Taxable,
    AccountType::TaxDeferred,
    AccountType::TaxExempt,
];

/// Highest tax cost today first, the baseline for withdrawal savings
pub const LEAST_EFFICIENT_ORDER: [AccountType; 3] = [
    AccountType::TaxDeferred,
    AccountType::Taxable,
    AccountType::TaxExempt,
];

const AMOUNT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalPreferences {
    /// Take required minimum distributions before anything else
    pub consider_rmds: bool,
    /// Draw each tier pro rata to balances so the mix across accounts holds
    pub maintain_allocation: bool,
}

impl Default for WithdrawalPreferences {
    fn default() -> Self {
        Self {
            consider_rmds: true,
            maintain_allocation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalReason {
    RequiredMinimumDistribution,
    Sequenced,
    ProRata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalStep {
    pub account_id: String,
    pub account_type: AccountType,
    pub amount: f64,
    /// Part of the amount that is taxable income or gain
    pub taxable_portion: f64,
    pub tax_cost: f64,
    pub reason: WithdrawalReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalPlan {
    pub required: f64,
    pub steps: Vec<WithdrawalStep>,
    pub total_withdrawn: f64,
    pub taxable_amount: f64,
    pub total_tax_cost: f64,
    /// Unmet part of the requirement when balances run out
    pub shortfall: f64,
    /// 1 − taxable fraction of the amount withdrawn
    pub efficiency: f64,
}

/// Plan `required` dollars of withdrawals in the efficient order.
pub fn plan_withdrawals(
    accounts: &[Account],
    required: f64,
    rates: &TaxRates,
    preferences: &WithdrawalPreferences,
) -> PlannerResult<WithdrawalPlan> {
    ensure_non_negative(required, "withdrawal_needs")?;
    Ok(plan_in_order(accounts, required, rates, preferences, &EFFICIENT_ORDER))
}

/// Tax cost of meeting `required` from the most expensive accounts first
pub fn least_efficient_tax_cost(accounts: &[Account], required: f64, rates: &TaxRates) -> f64 {
    let preferences = WithdrawalPreferences {
        consider_rmds: false,
        maintain_allocation: false,
    };
    plan_in_order(accounts, required, rates, &preferences, &LEAST_EFFICIENT_ORDER).total_tax_cost
}

fn plan_in_order(
    accounts: &[Account],
    required: f64,
    rates: &TaxRates,
    preferences: &WithdrawalPreferences,
    order: &[AccountType],
) -> WithdrawalPlan {
    let mut remaining: Vec<f64> = accounts.iter().map(|a| a.balance).collect();
    let mut steps = Vec::new();
    let mut still_needed = required;

    if preferences.consider_rmds {
        for (j, account) in accounts.iter().enumerate() {
            let rmd = account.required_minimum_distribution.min(remaining[j]);
            if account.account_type == AccountType::TaxDeferred && rmd > AMOUNT_TOLERANCE {
                remaining[j] -= rmd;
                still_needed -= rmd;
                steps.push(step(account, rmd, rates, WithdrawalReason::RequiredMinimumDistribution));
            }
        }
    }

    for tier in order {
        if still_needed <= AMOUNT_TOLERANCE {
            break;
        }
        let mut members: Vec<usize> = (0..accounts.len())
            .filter(|&j| accounts[j].account_type == *tier && remaining[j] > AMOUNT_TOLERANCE)
            .collect();
        // lowest embedded gain first, then by id
        members.sort_by(|&a, &b| {
            accounts[a]
                .gain_fraction()
                .partial_cmp(&accounts[b].gain_fraction())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| accounts[a].id.cmp(&accounts[b].id))
        });

        if preferences.maintain_allocation {
            let available: f64 = members.iter().map(|&j| remaining[j]).sum();
            let take = still_needed.min(available);
            for &j in &members {
                let amount = take * remaining[j] / available;
                remaining[j] -= amount;
                steps.push(step(&accounts[j], amount, rates, WithdrawalReason::ProRata));
            }
            still_needed -= take;
        } else {
            for &j in &members {
                if still_needed <= AMOUNT_TOLERANCE {
                    break;
                }
                let amount = still_needed.min(remaining[j]);
                remaining[j] -= amount;
                still_needed -= amount;
                steps.push(step(&accounts[j], amount, rates, WithdrawalReason::Sequenced));
            }
        }
    }

    let total_withdrawn: f64 = steps.iter().map(|s| s.amount).sum();
    let taxable_amount: f64 = steps.iter().map(|s| s.taxable_portion).sum();
    WithdrawalPlan {
        required,
        total_tax_cost: steps.iter().map(|s| s.tax_cost).sum(),
        steps,
        total_withdrawn,
        taxable_amount,
        shortfall: (required - total_withdrawn).max(0.0),
        efficiency: if total_withdrawn > 0.0 {
            1.0 - taxable_amount / total_withdrawn
        } else {
            1.0
        },
    }
}

fn step(account: &Account, amount: f64, rates: &TaxRates, reason: WithdrawalReason) -> WithdrawalStep {
    let (taxable_portion, rate) = match account.account_type {
        AccountType::Taxable => (amount * account.gain_fraction(), rates.capital_gains_rate()),
        AccountType::TaxDeferred => (amount, rates.ordinary_rate()),
        AccountType::TaxExempt => (0.0, 0.0),
    };
    WithdrawalStep {
        account_id: account.id.clone(),
        account_type: account.account_type,
        amount,
        taxable_portion,
        tax_cost: taxable_portion * rate,
        reason,
    }
}
