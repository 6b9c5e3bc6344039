//! Wash Sale Rule Monitoring
//!
//! A loss sale is at risk when the same or a substantially identical
//! security traded within the window around the sale date.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::tax_calculator::TaxRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A recent trade reported by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: TradeSide,
    pub date: NaiveDate,
    #[serde(default)]
    pub quantity: f64,
}

impl TradeRecord {
    pub fn new(symbol: impl Into<String>, side: TradeSide, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            date,
            quantity: 0.0,
        }
    }
}

/// Status of a wash sale check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WashSaleStatus {
    /// No matching trade in the window
    Safe,
    /// A matching trade falls in the window; the loss may be disallowed
    AtRisk,
}

impl std::fmt::Display for WashSaleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WashSaleStatus::Safe => write!(f, "Safe"),
            WashSaleStatus::AtRisk => write!(f, "At Risk"),
        }
    }
}

/// A wash sale window period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WashSaleWindow {
    /// Start of wash sale window
    pub window_start: NaiveDate,
    /// End of wash sale window
    pub window_end: NaiveDate,
}

impl WashSaleWindow {
    pub fn new(sale_date: NaiveDate, rules: &TaxRules) -> Self {
        let window_days = i64::from(rules.wash_sale_window_days);
        Self {
            window_start: sale_date - Duration::days(window_days),
            window_end: sale_date + Duration::days(window_days),
        }
    }

    /// Check if a date is within this window (both ends inclusive)
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.window_start && date <= self.window_end
    }

    /// First day a substantially identical purchase no longer matters
    pub fn safe_repurchase_date(&self) -> NaiveDate {
        self.window_end + Duration::days(1)
    }

    /// Days remaining in window
    pub fn days_remaining(&self, as_of: NaiveDate) -> i64 {
        (self.window_end - as_of).num_days().max(0)
    }
}

/// Outcome of checking one prospective loss sale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WashSaleCheck {
    pub symbol: String,
    pub status: WashSaleStatus,
    pub window: WashSaleWindow,
    /// Trades inside the window that match the symbol
    pub conflicting_trades: Vec<TradeRecord>,
}

impl WashSaleCheck {
    pub fn at_risk(&self) -> bool {
        self.status == WashSaleStatus::AtRisk
    }
}

/// Checks prospective loss sales against the caller's recent trades
pub struct WashSaleMonitor<'a> {
    rules: TaxRules,
    trades: &'a [TradeRecord],
}

impl<'a> WashSaleMonitor<'a> {
    pub fn new(rules: TaxRules, trades: &'a [TradeRecord]) -> Self {
        Self { rules, trades }
    }

    /// Check a sale of `symbol` on `sale_date`. `matches` decides whether a
    /// traded symbol is the same as or substantially identical to `symbol`.
    pub fn check<F>(&self, symbol: &str, sale_date: NaiveDate, matches: F) -> WashSaleCheck
    where
        F: Fn(&str) -> bool,
    {
        let window = WashSaleWindow::new(sale_date, &self.rules);
        let conflicting_trades: Vec<TradeRecord> = self
            .trades
            .iter()
            .filter(|t| window.contains(t.date) && matches(&t.symbol))
            .cloned()
            .collect();

        let status = if conflicting_trades.is_empty() {
            WashSaleStatus::Safe
        } else {
            WashSaleStatus::AtRisk
        };

        WashSaleCheck {
            symbol: symbol.to_string(),
            status,
            window,
            conflicting_trades,
        }
    }
}
