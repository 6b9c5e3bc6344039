//! Tax Calculator
//!
//! Rate schedule, holding-period rules and immutable tax lots.

use chrono::{Duration, NaiveDate};
use planner_core::validation::{ensure_non_negative, ensure_positive, ensure_probability};
use planner_core::{PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};

/// Calendar rules applied to lots and trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxRules {
    /// Wash sale window in days (before and after)
    pub wash_sale_window_days: u32,
    /// Days to qualify for long-term treatment
    pub long_term_threshold_days: u32,
}

impl Default for TaxRules {
    fn default() -> Self {
        Self {
            wash_sale_window_days: 30,
            long_term_threshold_days: 365,
        }
    }
}

/// Marginal rates supplied by the caller's tax-data source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxRates {
    /// Federal rate on ordinary income and short-term gains
    pub federal_ordinary: f64,
    /// Federal long-term capital gains rate
    pub federal_long_term: f64,
    /// State income tax rate
    pub state: f64,
    /// Net investment income tax rate
    pub niit: f64,
    /// Whether the investor is above the NIIT threshold
    pub niit_applies: bool,
}

impl Default for TaxRates {
    fn default() -> Self {
        Self {
            federal_ordinary: 0.24,
            federal_long_term: 0.15,
            state: 0.05,
            niit: 0.038,
            niit_applies: false,
        }
    }
}

impl TaxRates {
    fn applicable_niit(&self) -> f64 {
        if self.niit_applies {
            self.niit
        } else {
            0.0
        }
    }

    /// Long-term gains: federal long-term + state + NIIT when it applies.
    /// Harvested losses are valued at this rate.
    pub fn capital_gains_rate(&self) -> f64 {
        self.federal_long_term + self.state + self.applicable_niit()
    }

    /// Short-term gains and tax-deferred withdrawals
    pub fn ordinary_rate(&self) -> f64 {
        self.federal_ordinary + self.state
    }

    pub fn validate(&self) -> PlannerResult<()> {
        ensure_probability(self.federal_ordinary, "tax_rates.federal_ordinary")?;
        ensure_probability(self.federal_long_term, "tax_rates.federal_long_term")?;
        ensure_probability(self.state, "tax_rates.state")?;
        ensure_probability(self.niit, "tax_rates.niit")?;
        if self.ordinary_rate() > 1.0 || self.capital_gains_rate() > 1.0 {
            return Err(PlannerError::validation(
                "tax_rates",
                "combined rates must not exceed 100%",
            ));
        }
        Ok(())
    }
}

/// Holding period classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingPeriod {
    ShortTerm,
    LongTerm,
}

/// Type of gain/loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainType {
    ShortTermGain,
    ShortTermLoss,
    LongTermGain,
    LongTermLoss,
}

impl GainType {
    pub fn is_loss(&self) -> bool {
        matches!(self, GainType::ShortTermLoss | GainType::LongTermLoss)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self, GainType::LongTermGain | GainType::LongTermLoss)
    }
}

/// A tax lot representing a specific purchase. Lots are never edited:
/// selling part of one produces new lots through [`TaxLot::split`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLot {
    /// Unique ID
    pub id: String,
    /// Symbol
    pub symbol: String,
    /// Number of shares
    pub quantity: f64,
    /// Total cost basis
    pub cost_basis: f64,
    /// Purchase date
    pub purchase_date: NaiveDate,
}

impl TaxLot {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        quantity: f64,
        cost_basis: f64,
        purchase_date: NaiveDate,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            quantity,
            cost_basis,
            purchase_date,
        }
    }

    pub fn cost_per_share(&self) -> f64 {
        if self.quantity > 0.0 {
            self.cost_basis / self.quantity
        } else {
            0.0
        }
    }

    /// Get days held
    pub fn days_held(&self, as_of: NaiveDate) -> i64 {
        (as_of - self.purchase_date).num_days()
    }

    /// Get holding period as of a date
    pub fn holding_period(&self, as_of: NaiveDate, rules: &TaxRules) -> HoldingPeriod {
        if self.days_held(as_of) >= i64::from(rules.long_term_threshold_days) {
            HoldingPeriod::LongTerm
        } else {
            HoldingPeriod::ShortTerm
        }
    }

    /// Days until long-term, `None` once the lot already qualifies
    pub fn days_until_long_term(&self, as_of: NaiveDate, rules: &TaxRules) -> Option<i64> {
        let threshold = i64::from(rules.long_term_threshold_days);
        let held = self.days_held(as_of);
        (held < threshold).then_some(threshold - held)
    }

    /// Date the lot turns long-term
    pub fn long_term_date(&self, rules: &TaxRules) -> NaiveDate {
        self.purchase_date + Duration::days(i64::from(rules.long_term_threshold_days))
    }

    pub fn unrealized_gain_loss(&self, current_price: f64) -> f64 {
        self.quantity * current_price - self.cost_basis
    }

    pub fn gain_type(&self, current_price: f64, as_of: NaiveDate, rules: &TaxRules) -> GainType {
        let is_gain = self.unrealized_gain_loss(current_price) >= 0.0;
        let is_long_term = self.holding_period(as_of, rules) == HoldingPeriod::LongTerm;
        match (is_gain, is_long_term) {
            (true, true) => GainType::LongTermGain,
            (true, false) => GainType::ShortTermGain,
            (false, true) => GainType::LongTermLoss,
            (false, false) => GainType::ShortTermLoss,
        }
    }

    /// Split off `quantity` shares. Returns `(taken, remainder)`, both new
    /// lots sharing the purchase date, with basis divided pro rata.
    pub fn split(&self, quantity: f64) -> PlannerResult<(TaxLot, TaxLot)> {
        ensure_positive(quantity, "quantity")?;
        if quantity >= self.quantity {
            return Err(PlannerError::validation(
                "quantity",
                format!(
                    "must be less than the {} shares in lot {}",
                    self.quantity, self.id
                ),
            ));
        }
        let taken_basis = self.cost_per_share() * quantity;
        let taken = TaxLot {
            id: format!("{}.1", self.id),
            symbol: self.symbol.clone(),
            quantity,
            cost_basis: taken_basis,
            purchase_date: self.purchase_date,
        };
        let remainder = TaxLot {
            id: format!("{}.2", self.id),
            symbol: self.symbol.clone(),
            quantity: self.quantity - quantity,
            cost_basis: self.cost_basis - taken_basis,
            purchase_date: self.purchase_date,
        };
        Ok((taken, remainder))
    }

    pub fn validate(&self, index: usize) -> PlannerResult<()> {
        let field = |name: &str| format!("lots[{index}].{name}");
        if self.symbol.trim().is_empty() {
            return Err(PlannerError::validation(field("symbol"), "must not be empty"));
        }
        ensure_positive(self.quantity, &field("quantity"))?;
        ensure_non_negative(self.cost_basis, &field("cost_basis"))
    }
}

/// Tax estimate for a potential sale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxEstimate {
    /// Gain or loss amount
    pub gain_loss: f64,
    /// Type of gain/loss
    pub gain_type: GainType,
    /// Applicable tax rate
    pub tax_rate: f64,
    /// Estimated tax impact (negative = savings)
    pub tax_impact: f64,
    /// Holding period classification
    pub holding_period: HoldingPeriod,
    /// Days held
    pub days_held: i64,
    /// Days until long-term (if applicable)
    pub days_until_long_term: Option<i64>,
}

/// Tax calculator for one rate schedule
#[derive(Debug, Clone, Default)]
pub struct TaxCalculator {
    rates: TaxRates,
    rules: TaxRules,
}

impl TaxCalculator {
    pub fn new(rates: TaxRates, rules: TaxRules) -> Self {
        Self { rates, rules }
    }

    pub fn rates(&self) -> &TaxRates {
        &self.rates
    }

    pub fn rules(&self) -> &TaxRules {
        &self.rules
    }

    /// Tax avoided by realising `loss` against long-term gains
    pub fn harvest_savings(&self, loss: f64) -> f64 {
        loss.abs() * self.rates.capital_gains_rate()
    }

    /// Estimate tax impact for selling a lot at `current_price` on `as_of`
    pub fn estimate_sale(&self, lot: &TaxLot, current_price: f64, as_of: NaiveDate) -> TaxEstimate {
        let gain_loss = lot.unrealized_gain_loss(current_price);
        let gain_type = lot.gain_type(current_price, as_of, &self.rules);
        let tax_rate = if gain_type.is_long_term() {
            self.rates.capital_gains_rate()
        } else {
            self.rates.ordinary_rate()
        };

        TaxEstimate {
            gain_loss,
            gain_type,
            tax_rate,
            tax_impact: gain_loss * tax_rate,
            holding_period: lot.holding_period(as_of, &self.rules),
            days_held: lot.days_held(as_of),
            days_until_long_term: lot.days_until_long_term(as_of, &self.rules),
        }
    }
}
