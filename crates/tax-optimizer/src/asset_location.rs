//! Asset location: which account type should hold each asset.
//!
//! Each (asset, account) pair gets a suitability score from the asset class
//! and the account's tax treatment. Placement minimises the value-weighted
//! tax drag `value × (1 − score)` with the Hungarian algorithm over asset
//! rows and per-account slots. An account may hold any number of assets, so
//! capacity is enforced by repair: when the assignment overfills an account,
//! the asset that loses least by moving to an account with room is barred
//! from it and the assignment is solved again. A bounded branch and bound
//! then improves on the repaired placement where packing allows.

use planner_core::validation::ensure_probability;
use planner_core::{AccountType, Asset, AssetClass, PlannerResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hungarian;
use crate::models::Account;

const CAPACITY_TOLERANCE: f64 = 1e-6;
const DRAG_TOLERANCE: f64 = 1e-9;
const SEARCH_NODE_BUDGET: usize = 200_000;

/// Suitability of one asset class in each account type, in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountScores {
    pub taxable: f64,
    pub tax_deferred: f64,
    pub tax_exempt: f64,
}

impl AccountScores {
    pub const fn new(taxable: f64, tax_deferred: f64, tax_exempt: f64) -> Self {
        Self {
            taxable,
            tax_deferred,
            tax_exempt,
        }
    }

    pub fn get(&self, account_type: AccountType) -> f64 {
        match account_type {
            AccountType::Taxable => self.taxable,
            AccountType::TaxDeferred => self.tax_deferred,
            AccountType::TaxExempt => self.tax_exempt,
        }
    }

    fn validate(&self, field: &str) -> PlannerResult<()> {
        ensure_probability(self.taxable, &format!("{field}.taxable"))?;
        ensure_probability(self.tax_deferred, &format!("{field}.tax_deferred"))?;
        ensure_probability(self.tax_exempt, &format!("{field}.tax_exempt"))
    }
}

/// Score table by asset class. Bonds and REITs throw off income taxed at
/// ordinary rates and belong in tax-deferred accounts; equities compound
/// best tax-free and are tolerable in taxable accounts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationScores {
    pub stocks: AccountScores,
    pub bonds: AccountScores,
    pub real_estate: AccountScores,
    pub cash: AccountScores,
    pub commodities: AccountScores,
    pub alternatives: AccountScores,
}

impl Default for LocationScores {
    fn default() -> Self {
        Self {
            stocks: AccountScores::new(0.7, 0.5, 1.0),
            bonds: AccountScores::new(0.3, 1.0, 0.6),
            real_estate: AccountScores::new(0.3, 0.9, 0.7),
            cash: AccountScores::new(0.5, 0.5, 0.5),
            commodities: AccountScores::new(0.5, 0.5, 0.5),
            alternatives: AccountScores::new(0.5, 0.5, 0.5),
        }
    }
}

impl LocationScores {
    pub fn score(&self, asset_class: AssetClass, account_type: AccountType) -> f64 {
        let row = match asset_class {
            AssetClass::Stocks => &self.stocks,
            AssetClass::Bonds => &self.bonds,
            AssetClass::RealEstate => &self.real_estate,
            AssetClass::Cash => &self.cash,
            AssetClass::Commodities => &self.commodities,
            AssetClass::Alternatives => &self.alternatives,
        };
        row.get(account_type)
    }

    pub fn validate(&self) -> PlannerResult<()> {
        self.stocks.validate("config.location_scores.stocks")?;
        self.bonds.validate("config.location_scores.bonds")?;
        self.real_estate.validate("config.location_scores.real_estate")?;
        self.cash.validate("config.location_scores.cash")?;
        self.commodities.validate("config.location_scores.commodities")?;
        self.alternatives.validate("config.location_scores.alternatives")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub market_value: f64,
    pub account_id: String,
    pub account_type: AccountType,
    pub score: f64,
    /// Whether this differs from the account type the asset is held in now
    pub moved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUsage {
    pub account_id: String,
    pub account_type: AccountType,
    pub capacity: f64,
    pub assigned: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetLocation {
    pub placements: Vec<Placement>,
    /// Assets no account had room for
    pub unplaced: Vec<String>,
    pub accounts: Vec<AccountUsage>,
    /// Value-weighted score of the proposed placement
    pub score: f64,
    /// Value-weighted score of the assets where they are held now
    pub current_score: f64,
    /// Σ value × (1 − score); unplaced assets count in full
    pub tax_drag: f64,
    pub current_tax_drag: f64,
}

/// Place `assets` into `accounts` without exceeding any account's balance.
/// Assets are considered in symbol order so ties resolve alphabetically.
pub fn optimize_location(
    assets: &[Asset],
    accounts: &[Account],
    scores: &LocationScores,
) -> PlannerResult<AssetLocation> {
    let mut ordered: Vec<&Asset> = assets.iter().collect();
    ordered.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    let n = ordered.len();
    let m = accounts.len();

    let score = |i: usize, j: usize| scores.score(ordered[i].asset_class, accounts[j].account_type);
    let values: Vec<f64> = ordered.iter().map(|a| a.market_value).collect();
    // None where the asset is larger than the whole account
    let costs: Vec<Vec<Option<f64>>> = (0..n)
        .map(|i| {
            (0..m)
                .map(|j| {
                    (values[i] <= accounts[j].balance + CAPACITY_TOLERANCE)
                        .then(|| values[i] * (1.0 - score(i, j)))
                })
                .collect()
        })
        .collect();
    let capacity: Vec<f64> = accounts.iter().map(|a| a.balance).collect();

    let mut placed: Vec<Option<usize>> = vec![None; n];
    if m > 0 && n > 0 {
        placed = assign_with_repair(&ordered, accounts, &costs)?;
        fill_free_room(&values, &costs, &capacity, &mut placed);
        placed = refine(&values, &costs, &capacity, placed);
    }

    let loads = account_loads(&ordered, &placed, m);
    let mut placements = Vec::new();
    let mut unplaced = Vec::new();
    for (i, asset) in ordered.iter().enumerate() {
        match placed[i] {
            Some(j) => placements.push(Placement {
                symbol: asset.symbol.clone(),
                asset_class: asset.asset_class,
                market_value: asset.market_value,
                account_id: accounts[j].id.clone(),
                account_type: accounts[j].account_type,
                score: score(i, j),
                moved: asset.account.unwrap_or(AccountType::Taxable) != accounts[j].account_type,
            }),
            None => unplaced.push(asset.symbol.clone()),
        }
    }

    let total_value: f64 = ordered.iter().map(|a| a.market_value).sum();
    let placed_quality: f64 = placements.iter().map(|p| p.market_value * p.score).sum();
    let current_quality: f64 = ordered
        .iter()
        .map(|a| a.market_value * scores.score(a.asset_class, a.account.unwrap_or(AccountType::Taxable)))
        .sum();
    let weighted = |quality: f64| if total_value > 0.0 { quality / total_value } else { 1.0 };

    Ok(AssetLocation {
        placements,
        unplaced,
        accounts: accounts
            .iter()
            .zip(loads)
            .map(|(account, assigned)| AccountUsage {
                account_id: account.id.clone(),
                account_type: account.account_type,
                capacity: account.balance,
                assigned,
            })
            .collect(),
        score: weighted(placed_quality),
        current_score: weighted(current_quality),
        tax_drag: total_value - placed_quality,
        current_tax_drag: total_value - current_quality,
    })
}

/// Hungarian assignment over per-account slots, repaired until no account
/// is overfilled. The evicted asset is the cheapest one to move into an
/// account that still has room for it.
fn assign_with_repair(
    ordered: &[&Asset],
    accounts: &[Account],
    costs: &[Vec<Option<f64>>],
) -> PlannerResult<Vec<Option<usize>>> {
    let n = ordered.len();
    let m = accounts.len();
    let total_value: f64 = ordered.iter().map(|a| a.market_value).sum();
    let forbidden_cost = (total_value + 1.0) * 1e6;
    let mut barred: Vec<Vec<bool>> = costs.iter().map(|row| row.iter().map(Option::is_none).collect()).collect();
    let mut placed: Vec<Option<usize>> = vec![None; n];

    // every pair is barred at most once, so n·m rounds bound the repair
    for round in 0..=n * m {
        let cost: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..m * n)
                    .map(|slot| match costs[i][slot / n] {
                        Some(c) if !barred[i][slot / n] => c,
                        _ => forbidden_cost,
                    })
                    .collect()
            })
            .collect();
        placed = hungarian::solve(&cost)?
            .iter()
            .enumerate()
            .map(|(i, slot)| (!barred[i][slot / n]).then_some(slot / n))
            .collect();

        let loads = account_loads(ordered, &placed, m);
        let Some(full) = (0..m).find(|&j| loads[j] > accounts[j].balance + CAPACITY_TOLERANCE) else {
            break;
        };

        let evict = (0..n)
            .filter(|&i| placed[i] == Some(full))
            .map(|i| {
                let value = ordered[i].market_value;
                let fallback = (0..m)
                    .filter(|&k| k != full && !barred[i][k])
                    .filter(|&k| loads[k] + value <= accounts[k].balance + CAPACITY_TOLERANCE)
                    .filter_map(|k| costs[i][k])
                    .fold(f64::INFINITY, f64::min);
                // moving to a full account or nowhere costs the whole value
                let penalty = fallback.min(value) - costs[i][full].unwrap_or(value);
                (i, penalty)
            })
            .min_by(|(ia, pa), (ib, pb)| {
                pa.partial_cmp(pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ordered[*ib].symbol.cmp(&ordered[*ia].symbol))
            });
        if let Some((i, penalty)) = evict {
            debug!(
                round,
                symbol = %ordered[i].symbol,
                account = %accounts[full].id,
                penalty,
                "account over capacity, moving asset"
            );
            barred[i][full] = true;
        }
    }
    Ok(placed)
}

/// Put assets left out by the repair into the best account with room.
fn fill_free_room(
    values: &[f64],
    costs: &[Vec<Option<f64>>],
    capacity: &[f64],
    placed: &mut [Option<usize>],
) {
    let mut remaining = capacity.to_vec();
    for (i, account) in placed.iter().enumerate() {
        if let Some(j) = account {
            remaining[*j] -= values[i];
        }
    }
    for i in 0..placed.len() {
        if placed[i].is_some() {
            continue;
        }
        let best = (0..capacity.len())
            .filter(|&j| values[i] <= remaining[j] + CAPACITY_TOLERANCE)
            .filter_map(|j| costs[i][j].map(|c| (j, c)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((j, _)) = best {
            remaining[j] -= values[i];
            placed[i] = Some(j);
        }
    }
}

fn total_drag(values: &[f64], costs: &[Vec<Option<f64>>], placed: &[Option<usize>]) -> f64 {
    placed
        .iter()
        .enumerate()
        .map(|(i, account)| account.and_then(|j| costs[i][j]).unwrap_or(values[i]))
        .sum()
}

/// Depth-first branch and bound seeded with the repaired assignment. Only
/// strictly better placements replace it, and the node budget caps the work
/// on large portfolios.
fn refine(
    values: &[f64],
    costs: &[Vec<Option<f64>>],
    capacity: &[f64],
    incumbent: Vec<Option<usize>>,
) -> Vec<Option<usize>> {
    let n = values.len();
    // largest assets first so capacity conflicts surface early
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut bound = vec![0.0; n + 1];
    for depth in (0..n).rev() {
        let i = order[depth];
        let cheapest = costs[i].iter().flatten().fold(values[i], |acc, c| acc.min(*c));
        bound[depth] = bound[depth + 1] + cheapest;
    }

    let best_drag = total_drag(values, costs, &incumbent);
    let mut search = Search {
        values,
        costs,
        order,
        bound,
        remaining: capacity.to_vec(),
        current: vec![None; n],
        best: incumbent,
        best_drag,
        nodes: 0,
    };
    search.descend(0, 0.0);
    if search.nodes >= SEARCH_NODE_BUDGET {
        debug!(nodes = search.nodes, "placement search stopped at node budget");
    }
    search.best
}

struct Search<'a> {
    values: &'a [f64],
    costs: &'a [Vec<Option<f64>>],
    order: Vec<usize>,
    /// Lower bound on the drag of the assets from each depth onwards
    bound: Vec<f64>,
    remaining: Vec<f64>,
    current: Vec<Option<usize>>,
    best: Vec<Option<usize>>,
    best_drag: f64,
    nodes: usize,
}

impl Search<'_> {
    fn descend(&mut self, depth: usize, drag: f64) {
        if self.nodes >= SEARCH_NODE_BUDGET {
            return;
        }
        self.nodes += 1;
        if drag + self.bound[depth] >= self.best_drag - DRAG_TOLERANCE {
            return;
        }
        if depth == self.order.len() {
            self.best_drag = drag;
            self.best = self.current.clone();
            return;
        }

        let i = self.order[depth];
        let value = self.values[i];
        let mut options: Vec<(usize, f64)> = self.costs[i]
            .iter()
            .enumerate()
            .filter_map(|(j, c)| c.map(|c| (j, c)))
            .filter(|(j, _)| value <= self.remaining[*j] + CAPACITY_TOLERANCE)
            .collect();
        options.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        for (j, cost) in options {
            self.remaining[j] -= value;
            self.current[i] = Some(j);
            self.descend(depth + 1, drag + cost);
            self.remaining[j] += value;
        }
        self.current[i] = None;
        self.descend(depth + 1, drag + value);
    }
}

fn account_loads(assets: &[&Asset], placed: &[Option<usize>], m: usize) -> Vec<f64> {
    let mut loads = vec![0.0; m];
    for (asset, account) in assets.iter().zip(placed) {
        if let Some(j) = account {
            loads[*j] += asset.market_value;
        }
    }
    loads
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn asset(symbol: &str, class: AssetClass, value: f64) -> Asset {
        Asset::new(symbol, 0.06, 0.1)
            .with_class(class)
            .with_position(1.0, value, value)
    }

    fn three_accounts() -> Vec<Account> {
        vec![
            Account::new("brokerage", AccountType::Taxable, 50_000.0),
            Account::new("ira", AccountType::TaxDeferred, 30_000.0),
            Account::new("roth", AccountType::TaxExempt, 20_000.0),
        ]
    }

    fn account_of<'a>(location: &'a AssetLocation, symbol: &str) -> &'a str {
        &location
            .placements
            .iter()
            .find(|p| p.symbol == symbol)
            .unwrap()
            .account_id
    }

    #[test]
    fn test_classic_placement_with_capacity_repair() {
        let assets = vec![
            asset("SPY", AssetClass::Stocks, 50_000.0),
            asset("AGG", AssetClass::Bonds, 30_000.0),
            asset("VNQ", AssetClass::RealEstate, 20_000.0),
        ];
        let location = optimize_location(&assets, &three_accounts(), &LocationScores::default()).unwrap();

        assert_eq!(account_of(&location, "AGG"), "ira");
        // VNQ prefers the IRA but AGG loses more by moving
        assert_eq!(account_of(&location, "VNQ"), "roth");
        assert_eq!(account_of(&location, "SPY"), "brokerage");
        assert!(location.unplaced.is_empty());
        assert_relative_eq!(location.score, 0.79, epsilon = 1e-12);
        assert_relative_eq!(location.tax_drag, 21_000.0, epsilon = 1e-6);
        // all held in taxable today
        assert_relative_eq!(location.current_score, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let assets = vec![
            asset("AGG", AssetClass::Bonds, 12_000.0),
            asset("BND", AssetClass::Bonds, 9_000.0),
            asset("LQD", AssetClass::Bonds, 7_000.0),
            asset("QQQ", AssetClass::Stocks, 15_000.0),
            asset("SCHH", AssetClass::RealEstate, 6_000.0),
            asset("VTI", AssetClass::Stocks, 11_000.0),
        ];
        let accounts = vec![
            Account::new("brokerage", AccountType::Taxable, 25_000.0),
            Account::new("ira", AccountType::TaxDeferred, 20_000.0),
            Account::new("roth", AccountType::TaxExempt, 15_000.0),
        ];
        let location = optimize_location(&assets, &accounts, &LocationScores::default()).unwrap();

        for usage in &location.accounts {
            assert!(usage.assigned <= usage.capacity + 1e-6, "{usage:?}");
        }
        let mut symbols: Vec<&str> = location.placements.iter().map(|p| p.symbol.as_str()).collect();
        symbols.extend(location.unplaced.iter().map(String::as_str));
        symbols.sort_unstable();
        assert_eq!(symbols, vec!["AGG", "BND", "LQD", "QQQ", "SCHH", "VTI"]);
    }

    #[test]
    fn test_everything_placed_when_a_packing_exists() {
        let assets = vec![
            asset("A", AssetClass::Stocks, 60.0),
            asset("B", AssetClass::Stocks, 50.0),
            asset("C", AssetClass::Stocks, 50.0),
        ];
        let accounts = vec![
            Account::new("roth", AccountType::TaxExempt, 100.0),
            Account::new("brokerage", AccountType::Taxable, 60.0),
        ];
        let location = optimize_location(&assets, &accounts, &LocationScores::default()).unwrap();

        assert!(location.unplaced.is_empty(), "{:?}", location.unplaced);
        assert_eq!(account_of(&location, "A"), "brokerage");
        assert_eq!(account_of(&location, "B"), "roth");
        assert_eq!(account_of(&location, "C"), "roth");
        assert_relative_eq!(location.tax_drag, 18.0, epsilon = 1e-9);
        for usage in &location.accounts {
            assert!(usage.assigned <= usage.capacity + 1e-6, "{usage:?}");
        }
    }

    #[test]
    fn test_search_keeps_optimum_under_tight_capacity() {
        // 40 + 35 + 25 exactly fill the two accounts only one way
        let assets = vec![
            asset("AGG", AssetClass::Bonds, 40.0),
            asset("BND", AssetClass::Bonds, 35.0),
            asset("VTI", AssetClass::Stocks, 25.0),
        ];
        let accounts = vec![
            Account::new("ira", AccountType::TaxDeferred, 65.0),
            Account::new("brokerage", AccountType::Taxable, 35.0),
        ];
        let location = optimize_location(&assets, &accounts, &LocationScores::default()).unwrap();
        assert!(location.unplaced.is_empty());
        assert_eq!(account_of(&location, "AGG"), "ira");
        assert_eq!(account_of(&location, "VTI"), "ira");
        assert_eq!(account_of(&location, "BND"), "brokerage");
    }

    #[test]
    fn test_asset_larger_than_every_account_is_unplaced() {
        let assets = vec![asset("SPY", AssetClass::Stocks, 80_000.0)];
        let location = optimize_location(&assets, &three_accounts(), &LocationScores::default()).unwrap();
        assert!(location.placements.is_empty());
        assert_eq!(location.unplaced, vec!["SPY".to_string()]);
        assert_relative_eq!(location.score, 0.0);
    }

    #[test]
    fn test_ties_resolved_by_symbol() {
        let assets = vec![
            asset("BBB", AssetClass::Bonds, 10_000.0),
            asset("AAA", AssetClass::Bonds, 10_000.0),
        ];
        let accounts = vec![
            Account::new("ira", AccountType::TaxDeferred, 10_000.0),
            Account::new("brokerage", AccountType::Taxable, 10_000.0),
        ];
        let location = optimize_location(&assets, &accounts, &LocationScores::default()).unwrap();
        assert_eq!(account_of(&location, "AAA"), "ira");
        assert_eq!(account_of(&location, "BBB"), "brokerage");
    }

    #[test]
    fn test_scores_are_configurable() {
        let scores = LocationScores {
            stocks: AccountScores::new(1.0, 0.0, 0.0),
            ..LocationScores::default()
        };
        let assets = vec![asset("VTI", AssetClass::Stocks, 10_000.0)];
        let location = optimize_location(&assets, &three_accounts(), &scores).unwrap();
        assert_eq!(account_of(&location, "VTI"), "brokerage");

        let bad = LocationScores {
            bonds: AccountScores::new(1.5, 0.0, 0.0),
            ..LocationScores::default()
        };
        assert!(bad.validate().is_err());
    }
}
