//! Tax-Loss Harvesting Engine
//!
//! Finds taxable positions whose unrealised loss is worth realising, pairs
//! each with substitutes that keep the market exposure and flags wash-sale
//! risk from recent trades.

use chrono::{Datelike, NaiveDate};
use planner_core::validation::ensure_non_negative;
use planner_core::{AccountType, Asset, PlannerResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::TaxPortfolio;
use crate::substitutes::{SubstituteFinder, SubstituteSecurity};
use crate::tax_calculator::{GainType, TaxCalculator, TaxLot};
use crate::wash_sale::WashSaleMonitor;

/// Priority level for harvesting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestPriority {
    /// Low priority - small potential savings
    Low,
    /// Medium priority - moderate savings
    Medium,
    /// High priority - significant savings
    High,
    /// Urgent - time-sensitive (year-end)
    Urgent,
}

impl HarvestPriority {
    /// Determine priority based on tax savings
    pub fn from_savings(savings: f64, is_year_end: bool) -> Self {
        if is_year_end && savings > 100.0 {
            return Self::Urgent;
        }

        if savings >= 1000.0 {
            Self::High
        } else if savings >= 250.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Loss carried by one lot of a harvestable position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotLoss {
    pub lot_id: String,
    pub quantity: f64,
    /// Loss amount (positive number)
    pub loss: f64,
    pub loss_type: GainType,
}

/// A tax-loss harvesting opportunity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestOpportunity {
    /// Symbol to harvest
    pub symbol: String,
    pub market_value: f64,
    pub cost_basis: f64,
    /// Unrealized loss (positive number)
    pub unrealized_loss: f64,
    /// Estimated tax savings
    pub potential_savings: f64,
    /// Short or long term when every harvested lot agrees, `None` otherwise
    pub loss_type: Option<GainType>,
    /// Lots carrying the loss; empty when the position has no lot detail
    pub lots: Vec<LotLoss>,
    /// Priority level
    pub priority: HarvestPriority,
    /// Substitute securities to buy, best first
    pub alternatives: Vec<SubstituteSecurity>,
    /// A substantially identical security traded inside the wash-sale window
    pub wash_sale_risk: bool,
    /// Whether the loss can be taken now
    pub harvestable: bool,
    /// First date the original security can be bought back
    pub wash_sale_safe_date: NaiveDate,
    /// Days until the earliest short-term loss lot turns long-term
    pub days_until_long_term: Option<i64>,
    /// Reason/explanation
    pub reason: String,
}

/// Harvesting engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestingConfig {
    /// Minimum loss to consider (in dollars)
    pub min_loss_threshold: f64,
    /// Whether to include short-term losses
    pub include_short_term: bool,
    /// Whether to include long-term losses
    pub include_long_term: bool,
    /// Skip positions with no acceptable substitute
    pub require_alternative: bool,
    /// Maximum number of opportunities to return
    pub max_opportunities: Option<usize>,
}

impl Default for HarvestingConfig {
    fn default() -> Self {
        Self {
            min_loss_threshold: 1000.0,
            include_short_term: true,
            include_long_term: true,
            require_alternative: true,
            max_opportunities: None,
        }
    }
}

impl HarvestingConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        ensure_non_negative(self.min_loss_threshold, "config.harvesting.min_loss_threshold")
    }
}

/// Summary of harvesting opportunities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestSummary {
    pub total_opportunities: usize,
    pub harvestable_opportunities: usize,
    /// Savings of the opportunities that can be taken now
    pub total_potential_savings: f64,
    /// Every taxable loss at or above the threshold, emitted or not
    pub total_identified_loss: f64,
    /// Losses that can be realised now with a substitute in hand
    pub harvestable_loss: f64,
    pub short_term_opportunities: usize,
    pub long_term_opportunities: usize,
    pub high_priority_opportunities: usize,
}

impl HarvestSummary {
    /// Harvestable share of the identified loss; 1 when nothing was identified
    pub fn efficiency(&self) -> f64 {
        if self.total_identified_loss > 0.0 {
            (self.harvestable_loss / self.total_identified_loss).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestScan {
    pub opportunities: Vec<HarvestOpportunity>,
    pub summary: HarvestSummary,
}

/// Engine for finding tax-loss harvesting opportunities
pub struct HarvestingEngine {
    calculator: TaxCalculator,
    finder: SubstituteFinder,
    config: HarvestingConfig,
}

impl HarvestingEngine {
    pub fn new(calculator: TaxCalculator, finder: SubstituteFinder, config: HarvestingConfig) -> Self {
        Self {
            calculator,
            finder,
            config,
        }
    }

    /// Opportunities in `portfolio` on `as_of`, ranked by savings descending
    pub fn find_opportunities(&self, portfolio: &TaxPortfolio, as_of: NaiveDate) -> HarvestScan {
        let rules = self.calculator.rules();
        let monitor = WashSaleMonitor::new(*rules, &portfolio.recent_trades);
        let is_year_end = as_of.month() == 12;
        let mut opportunities = Vec::new();
        let mut total_identified_loss = 0.0;

        for asset in portfolio.assets.iter().filter(|a| is_taxable(a)) {
            let lots: Vec<&TaxLot> = portfolio
                .lots
                .iter()
                .filter(|l| l.symbol == asset.symbol)
                .collect();
            let Some((unrealized_loss, lot_losses)) = self.position_loss(asset, &lots, as_of) else {
                continue;
            };
            if unrealized_loss < self.config.min_loss_threshold {
                continue;
            }
            total_identified_loss += unrealized_loss;

            let alternatives = self.finder.find_substitutes(&asset.symbol, &portfolio.universe);
            if alternatives.is_empty() && self.config.require_alternative {
                debug!(symbol = %asset.symbol, unrealized_loss, "no substitute, loss not harvested");
                continue;
            }

            let check = monitor.check(&asset.symbol, as_of, |traded| {
                self.finder
                    .is_substantially_identical(&asset.symbol, traded, &portfolio.universe)
            });
            let potential_savings = self.calculator.harvest_savings(unrealized_loss);
            let days_until_long_term = lots
                .iter()
                .filter(|l| lot_losses.iter().any(|ll| ll.lot_id == l.id))
                .filter_map(|l| l.days_until_long_term(as_of, rules))
                .min();

            let reason = self.generate_reason(asset, unrealized_loss, potential_savings, days_until_long_term);
            opportunities.push(HarvestOpportunity {
                symbol: asset.symbol.clone(),
                market_value: asset.market_value,
                cost_basis: asset.cost_basis,
                unrealized_loss,
                potential_savings,
                loss_type: common_loss_type(&lot_losses),
                lots: lot_losses,
                priority: HarvestPriority::from_savings(potential_savings, is_year_end),
                alternatives,
                wash_sale_risk: check.at_risk(),
                harvestable: !check.at_risk(),
                wash_sale_safe_date: check.window.safe_repurchase_date(),
                days_until_long_term,
                reason,
            });
        }

        opportunities.sort_by(|a, b| {
            b.potential_savings
                .partial_cmp(&a.potential_savings)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        if let Some(limit) = self.config.max_opportunities {
            opportunities.truncate(limit);
        }

        let summary = summarize(&opportunities, total_identified_loss);
        HarvestScan {
            opportunities,
            summary,
        }
    }

    /// Loss of the position with its lot breakdown. Lots filtered out by the
    /// term preferences do not count. `None` when there is no loss.
    fn position_loss(&self, asset: &Asset, lots: &[&TaxLot], as_of: NaiveDate) -> Option<(f64, Vec<LotLoss>)> {
        let rules = self.calculator.rules();
        match asset.price() {
            Some(price) if !lots.is_empty() => {
                let lot_losses: Vec<LotLoss> = lots
                    .iter()
                    .filter_map(|lot| {
                        let gain_loss = lot.unrealized_gain_loss(price);
                        let loss_type = lot.gain_type(price, as_of, rules);
                        let wanted = if loss_type.is_long_term() {
                            self.config.include_long_term
                        } else {
                            self.config.include_short_term
                        };
                        (gain_loss < 0.0 && wanted).then(|| LotLoss {
                            lot_id: lot.id.clone(),
                            quantity: lot.quantity,
                            loss: -gain_loss,
                            loss_type,
                        })
                    })
                    .collect();
                let total: f64 = lot_losses.iter().map(|l| l.loss).sum();
                (total > 0.0).then_some((total, lot_losses))
            }
            _ => {
                let gain_loss = asset.unrealized_gain_loss();
                (gain_loss < 0.0).then(|| (-gain_loss, Vec::new()))
            }
        }
    }

    /// Generate a human-readable reason for the opportunity
    fn generate_reason(&self, asset: &Asset, loss: f64, savings: f64, days_until_lt: Option<i64>) -> String {
        let mut reasons = vec![format!(
            "Potential ${:.0} tax savings from ${:.0} loss",
            savings, loss
        )];

        if let Some(days) = days_until_lt {
            if days <= 30 {
                reasons.push(format!("Turns long-term in {days} days"));
            }
        }

        if asset.cost_basis > 0.0 {
            let loss_pct = loss / asset.cost_basis * 100.0;
            if loss_pct > 20.0 {
                reasons.push(format!("Significant {:.1}% loss from cost basis", loss_pct));
            }
        }

        reasons.join(". ")
    }
}

/// Positions with no recorded account are treated as taxable
fn is_taxable(asset: &Asset) -> bool {
    asset.account.unwrap_or(AccountType::Taxable) == AccountType::Taxable
}

fn common_loss_type(lots: &[LotLoss]) -> Option<GainType> {
    let first = lots.first()?.loss_type;
    lots.iter().all(|l| l.loss_type == first).then_some(first)
}

fn summarize(opportunities: &[HarvestOpportunity], total_identified_loss: f64) -> HarvestSummary {
    let harvestable: Vec<&HarvestOpportunity> = opportunities.iter().filter(|o| o.harvestable).collect();
    HarvestSummary {
        total_opportunities: opportunities.len(),
        harvestable_opportunities: harvestable.len(),
        total_potential_savings: harvestable.iter().map(|o| o.potential_savings).sum(),
        total_identified_loss,
        harvestable_loss: harvestable.iter().map(|o| o.unrealized_loss).sum(),
        short_term_opportunities: opportunities
            .iter()
            .filter(|o| o.loss_type == Some(GainType::ShortTermLoss))
            .count(),
        long_term_opportunities: opportunities
            .iter()
            .filter(|o| o.loss_type == Some(GainType::LongTermLoss))
            .count(),
        high_priority_opportunities: opportunities
            .iter()
            .filter(|o| o.priority >= HarvestPriority::High)
            .count(),
    }
}
