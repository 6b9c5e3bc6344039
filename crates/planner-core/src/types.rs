use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{PlannerError, PlannerResult};
use crate::validation::{ensure_finite, ensure_non_negative, ensure_open_unit, ensure_rate};

/// Tolerance for allocation weights summing to one.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Symbol → weight mapping. Ordered by symbol so results serialise stably.
pub type Allocation = BTreeMap<String, f64>;

/// Broad asset class, used by tax location scoring and substitute matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stocks,
    Bonds,
    #[serde(alias = "reits")]
    RealEstate,
    Cash,
    Commodities,
    Alternatives,
}

impl Default for AssetClass {
    fn default() -> Self {
        Self::Stocks
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetClass::Stocks => write!(f, "Stocks"),
            AssetClass::Bonds => write!(f, "Bonds"),
            AssetClass::RealEstate => write!(f, "Real Estate"),
            AssetClass::Cash => write!(f, "Cash"),
            AssetClass::Commodities => write!(f, "Commodities"),
            AssetClass::Alternatives => write!(f, "Alternatives"),
        }
    }
}

/// Tax treatment of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Brokerage account, gains taxed on realisation
    Taxable,
    /// Traditional IRA / 401k, withdrawals taxed as ordinary income
    #[serde(alias = "traditional_ira", alias = "traditional_401k", alias = "traditional")]
    TaxDeferred,
    /// Roth IRA / Roth 401k, qualified withdrawals untaxed
    #[serde(alias = "roth_ira", alias = "roth_401k", alias = "roth")]
    TaxExempt,
}

impl AccountType {
    pub const ALL: [AccountType; 3] = [
        AccountType::Taxable,
        AccountType::TaxDeferred,
        AccountType::TaxExempt,
    ];
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountType::Taxable => write!(f, "Taxable"),
            AccountType::TaxDeferred => write!(f, "Tax-Deferred"),
            AccountType::TaxExempt => write!(f, "Tax-Exempt"),
        }
    }
}

/// A single holding with its return assumptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Unique key within a portfolio
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub asset_class: AssetClass,
    #[serde(default)]
    pub quantity: f64,
    /// Market value (quantity × price, maintained by the caller)
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub cost_basis: f64,
    /// Annual expected return
    #[serde(default)]
    pub expected_return: f64,
    /// Annual volatility
    #[serde(default)]
    pub volatility: f64,
    #[serde(default)]
    pub sector: Option<String>,
    /// Account the asset is currently held in
    #[serde(default)]
    pub account: Option<AccountType>,
    /// Market capitalisation, used for equilibrium weights
    #[serde(default)]
    pub market_cap: Option<f64>,
    /// Historical periodic returns, oldest first
    #[serde(default)]
    pub historical_returns: Option<Vec<f64>>,
}

impl Asset {
    pub fn new(symbol: impl Into<String>, expected_return: f64, volatility: f64) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            asset_class: AssetClass::default(),
            quantity: 0.0,
            market_value: 0.0,
            cost_basis: 0.0,
            expected_return,
            volatility,
            sector: None,
            account: None,
            market_cap: None,
            historical_returns: None,
        }
    }

    pub fn with_class(mut self, asset_class: AssetClass) -> Self {
        self.asset_class = asset_class;
        self
    }

    pub fn with_position(mut self, quantity: f64, market_value: f64, cost_basis: f64) -> Self {
        self.quantity = quantity;
        self.market_value = market_value;
        self.cost_basis = cost_basis;
        self
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    pub fn with_account(mut self, account: AccountType) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_market_cap(mut self, market_cap: f64) -> Self {
        self.market_cap = Some(market_cap);
        self
    }

    pub fn with_history(mut self, returns: Vec<f64>) -> Self {
        self.historical_returns = Some(returns);
        self
    }

    /// Positive for a gain, negative for a loss
    pub fn unrealized_gain_loss(&self) -> f64 {
        self.market_value - self.cost_basis
    }

    pub fn price(&self) -> Option<f64> {
        if self.quantity > 0.0 {
            Some(self.market_value / self.quantity)
        } else {
            None
        }
    }

    pub fn validate(&self, index: usize) -> PlannerResult<()> {
        let field = |name: &str| format!("assets[{index}].{name}");
        if self.symbol.trim().is_empty() {
            return Err(PlannerError::validation(field("symbol"), "must not be empty"));
        }
        ensure_non_negative(self.quantity, &field("quantity"))?;
        ensure_non_negative(self.market_value, &field("market_value"))?;
        ensure_non_negative(self.cost_basis, &field("cost_basis"))?;
        ensure_rate(self.expected_return, &field("expected_return"))?;
        ensure_non_negative(self.volatility, &field("volatility"))?;
        if let Some(cap) = self.market_cap {
            ensure_non_negative(cap, &field("market_cap"))?;
        }
        if let Some(history) = &self.historical_returns {
            for (i, r) in history.iter().enumerate() {
                ensure_finite(*r, &field(&format!("historical_returns[{i}]")))?;
            }
        }
        Ok(())
    }
}

/// Symbol-keyed set of assets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub assets: Vec<Asset>,
}

impl Portfolio {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self { assets }
    }

    pub fn total_value(&self) -> f64 {
        self.assets.iter().map(|a| a.market_value).sum()
    }

    pub fn get(&self, symbol: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    /// Current allocation by market value. Empty when the portfolio has no value.
    pub fn current_allocation(&self) -> Allocation {
        let total = self.total_value();
        if total <= 0.0 {
            return Allocation::new();
        }
        let mut weights = Allocation::new();
        for asset in &self.assets {
            *weights.entry(asset.symbol.clone()).or_insert(0.0) += asset.market_value / total;
        }
        weights
    }

    pub fn validate(&self) -> PlannerResult<()> {
        validate_assets(&self.assets)
    }
}

/// Validate each asset and require unique symbols.
pub fn validate_assets(assets: &[Asset]) -> PlannerResult<()> {
    let mut seen = HashSet::new();
    for (i, asset) in assets.iter().enumerate() {
        asset.validate(i)?;
        if !seen.insert(asset.symbol.as_str()) {
            return Err(PlannerError::validation(
                format!("assets[{i}].symbol"),
                format!("duplicate symbol {}", asset.symbol),
            ));
        }
    }
    Ok(())
}

/// Weights must lie in [0,1] and sum to 1 within `WEIGHT_SUM_TOLERANCE`.
pub fn validate_allocation(allocation: &Allocation, field: &str) -> PlannerResult<()> {
    if allocation.is_empty() {
        return Err(PlannerError::validation(field, "allocation is empty"));
    }
    let mut sum = 0.0;
    for (symbol, weight) in allocation {
        let name = format!("{field}[{symbol}]");
        ensure_finite(*weight, &name)?;
        if !(0.0..=1.0).contains(weight) {
            return Err(PlannerError::validation(name, format!("weight {weight} outside [0, 1]")));
        }
        sum += weight;
    }
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(PlannerError::validation(
            field,
            format!("weights sum to {sum:.8}, expected 1"),
        ));
    }
    Ok(())
}

/// What a market view is about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewKind {
    /// Expected return of a single asset
    Absolute { symbol: String },
    /// `outperformer` beats `underperformer` by the view's return
    Relative {
        outperformer: String,
        underperformer: String,
    },
}

/// Subjective return estimate supplied per optimisation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
    #[serde(flatten)]
    pub kind: ViewKind,
    /// Annual return (or spread, for relative views)
    pub expected_return: f64,
    /// Confidence in (0, 1]
    pub confidence: f64,
}

impl MarketView {
    pub fn absolute(symbol: impl Into<String>, expected_return: f64, confidence: f64) -> Self {
        Self {
            kind: ViewKind::Absolute {
                symbol: symbol.into(),
            },
            expected_return,
            confidence,
        }
    }

    pub fn relative(
        outperformer: impl Into<String>,
        underperformer: impl Into<String>,
        spread: f64,
        confidence: f64,
    ) -> Self {
        Self {
            kind: ViewKind::Relative {
                outperformer: outperformer.into(),
                underperformer: underperformer.into(),
            },
            expected_return: spread,
            confidence,
        }
    }

    pub fn symbols(&self) -> Vec<&str> {
        match &self.kind {
            ViewKind::Absolute { symbol } => vec![symbol.as_str()],
            ViewKind::Relative {
                outperformer,
                underperformer,
            } => vec![outperformer.as_str(), underperformer.as_str()],
        }
    }

    pub fn validate(&self, index: usize, known_symbols: &[&str]) -> PlannerResult<()> {
        let field = format!("market_views[{index}]");
        ensure_finite(self.expected_return, &format!("{field}.expected_return"))?;
        ensure_finite(self.confidence, &format!("{field}.confidence"))?;
        if self.confidence <= 0.0 || self.confidence > 1.0 {
            return Err(PlannerError::validation(
                format!("{field}.confidence"),
                format!("must lie in (0, 1], got {}", self.confidence),
            ));
        }
        for symbol in self.symbols() {
            if !known_symbols.contains(&symbol) {
                return Err(PlannerError::validation(
                    field.clone(),
                    format!("references unknown asset {symbol}"),
                ));
            }
        }
        if let ViewKind::Relative {
            outperformer,
            underperformer,
        } = &self.kind
        {
            if outperformer == underperformer {
                return Err(PlannerError::validation(
                    field,
                    "relative view needs two distinct assets",
                ));
            }
        }
        Ok(())
    }
}

/// Check an alpha-style tail probability
pub fn validate_tail_probability(alpha: f64, field: &str) -> PlannerResult<()> {
    ensure_open_unit(alpha, field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_allocation_sums_to_one() {
        let portfolio = Portfolio::new(vec![
            Asset::new("SPY", 0.08, 0.18).with_position(100.0, 45075.0, 42000.0),
            Asset::new("AGG", 0.04, 0.06).with_position(200.0, 20000.0, 19500.0),
            Asset::new("CASH", 0.02, 0.0).with_position(1.0, 5000.0, 5000.0),
        ]);
        let allocation = portfolio.current_allocation();
        let sum: f64 = allocation.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(validate_allocation(&allocation, "allocation").is_ok());
        assert!((portfolio.total_value() - 70075.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_symbols_rejected() {
        let assets = vec![Asset::new("SPY", 0.08, 0.18), Asset::new("SPY", 0.07, 0.2)];
        let err = validate_assets(&assets).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "assets[1].symbol"));
    }

    #[test]
    fn test_negative_volatility_rejected() {
        let err = Asset::new("SPY", 0.08, -0.1).validate(0).unwrap_err();
        assert!(matches!(err, PlannerError::Validation { ref field, .. } if field == "assets[0].volatility"));
    }

    #[test]
    fn test_allocation_must_sum_to_one() {
        let mut allocation = Allocation::new();
        allocation.insert("stocks".to_string(), 0.6);
        allocation.insert("bonds".to_string(), 0.3);
        assert!(validate_allocation(&allocation, "allocation").is_err());
    }

    #[test]
    fn test_view_validation() {
        let known = ["SPY", "AGG"];
        assert!(MarketView::absolute("SPY", 0.09, 0.5).validate(0, &known).is_ok());
        assert!(MarketView::absolute("QQQ", 0.09, 0.5).validate(0, &known).is_err());
        assert!(MarketView::absolute("SPY", 0.09, 0.0).validate(0, &known).is_err());
        assert!(MarketView::relative("SPY", "SPY", 0.02, 0.5).validate(0, &known).is_err());
    }

    #[test]
    fn test_view_deserializes_from_tagged_json() {
        let json = r#"{"type":"relative","outperformer":"SPY","underperformer":"AGG","expected_return":0.03,"confidence":0.6}"#;
        let view: MarketView = serde_json::from_str(json).unwrap();
        assert_eq!(view.symbols(), vec!["SPY", "AGG"]);
    }
}
